//! Symbol lookups in `/proc/kallsyms`.

use std::path::Path;

use crate::error::Error;

/// Find the address of an exactly-matching kernel symbol name, or `Ok(None)`
/// if the symbol is not listed. Note that without `CAP_SYSLOG`, the kernel
/// reports every address as zero.
pub fn symbol_address(name: &str) -> Result<Option<u64>, Error> {
    let data = std::fs::read(Path::new("/proc/kallsyms")).map_err(|source| Error::FileIo {
        path: "/proc/kallsyms".into(),
        source,
    })?;
    symbol_address_in(&data, name)
}

/// Lines have the shape "ADDRESS TYPE NAME [module]".
fn symbol_address_in(data: &[u8], name: &str) -> Result<Option<u64>, Error> {
    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let line = std::str::from_utf8(line).map_err(|_| Error::ProcKallsymsParse)?;
        let mut fields = line.split_ascii_whitespace();
        let (Some(address), Some(_kind), Some(symbol)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::ProcKallsymsParse);
        };
        if symbol != name {
            continue;
        }
        return u64::from_str_radix(address, 16)
            .map(Some)
            .map_err(|_| Error::ProcKallsymsParse);
    }
    Ok(None)
}
