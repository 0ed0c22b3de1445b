use std::num::IntErrorKind;
use std::path::Path;

use byteorder::{ByteOrder, NativeEndian};
use memchr::memchr;

use crate::error::Error;
use crate::target::TargetMemory;

/// Longest accepted `OSRELEASE` value, matching the kernel's buffer.
const OSRELEASE_MAX_LEN: usize = 128;

/// Runtime parameters recovered from the kernel's `VMCOREINFO` note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vmcoreinfo {
    /// `uname -r` of the target kernel.
    pub osrelease: String,
    pub page_size: u64,
    /// KASLR slide, 0 if the kernel was not relocated.
    pub kaslr_offset: u64,
    /// Address of the initial page table root.
    pub swapper_pg_dir: u64,
    pub pgtable_l5_enabled: bool,
}

impl Vmcoreinfo {
    /// Parse the key=value text body of a `VMCOREINFO` note.
    ///
    /// Only the keys this crate needs are interpreted; all other lines are
    /// ignored, as is a trailing line without a newline terminator.
    /// `OSRELEASE`, `PAGESIZE`, and `SYMBOL(swapper_pg_dir)` are required.
    pub fn parse(desc: &[u8]) -> Result<Self, Error> {
        let mut osrelease = String::new();
        let mut page_size = 0;
        let mut kaslr_offset = 0;
        let mut swapper_pg_dir = 0;
        let mut pgtable_l5_enabled = false;

        let mut rest = desc;
        while !rest.is_empty() {
            let Some(newline) = memchr(b'\n', rest) else {
                break;
            };
            let line = &rest[..newline];
            rest = &rest[newline + 1..];

            if let Some(value) = line.strip_prefix(b"OSRELEASE=") {
                if value.len() >= OSRELEASE_MAX_LEN {
                    return Err(Error::VmcoreinfoOsReleaseTooLong);
                }
                osrelease = String::from_utf8_lossy(value).into_owned();
            } else if let Some(value) = line.strip_prefix(b"PAGESIZE=") {
                page_size = parse_number(value, 10, "PAGESIZE")?;
            } else if let Some(value) = line.strip_prefix(b"KERNELOFFSET=") {
                kaslr_offset = parse_number(value, 16, "KERNELOFFSET")?;
            } else if let Some(value) = line.strip_prefix(b"SYMBOL(swapper_pg_dir)=") {
                swapper_pg_dir = parse_number(value, 16, "SYMBOL(swapper_pg_dir)")?;
            } else if let Some(value) = line.strip_prefix(b"NUMBER(pgtable_l5_enabled)=") {
                pgtable_l5_enabled = parse_number(value, 10, "NUMBER(pgtable_l5_enabled)")? != 0;
            }
        }

        if osrelease.is_empty() {
            return Err(Error::VmcoreinfoMissingField("OSRELEASE"));
        }
        if page_size == 0 {
            return Err(Error::VmcoreinfoMissingField("PAGESIZE"));
        }
        if swapper_pg_dir == 0 {
            return Err(Error::VmcoreinfoMissingField("swapper_pg_dir"));
        }
        // KERNELOFFSET and pgtable_l5_enabled are optional.
        Ok(Vmcoreinfo {
            osrelease,
            page_size,
            kaslr_offset,
            swapper_pg_dir,
            pgtable_l5_enabled,
        })
    }
}

fn parse_number(value: &[u8], radix: u32, key: &'static str) -> Result<u64, Error> {
    let s = std::str::from_utf8(value).map_err(|_| Error::VmcoreinfoInvalidNumber(key))?;
    u64::from_str_radix(s, radix).map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow => Error::VmcoreinfoNumberOutOfRange(key),
        _ => Error::VmcoreinfoInvalidNumber(key),
    })
}

/// Recover the `VMCOREINFO` note for kernels whose `/proc/kcore` predates the
/// embedded note (before v4.19): `/sys/kernel/vmcoreinfo` exports the
/// physical address and size of the note, which we then read from target
/// memory and unwrap.
pub fn read_vmcoreinfo_fallback<R: TargetMemory>(memory: &R) -> Result<Vmcoreinfo, Error> {
    read_vmcoreinfo_fallback_at(Path::new("/sys/kernel/vmcoreinfo"), memory)
}

fn read_vmcoreinfo_fallback_at<R: TargetMemory>(
    path: &Path,
    memory: &R,
) -> Result<Vmcoreinfo, Error> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::FileIo {
        path: path.to_owned(),
        source,
    })?;
    // "%x %x": physical address and size of the note.
    let mut fields = text.split_whitespace();
    let address = fields
        .next()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or(Error::SysVmcoreinfoParse)?;
    let size = fields
        .next()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or(Error::SysVmcoreinfoParse)?;

    let mut buf = vec![0; size];
    memory
        .read_memory(address, &mut buf, true)
        .map_err(|source| Error::TargetMemory { address, source })?;

    // The first 12 bytes are the note header (identical in the 32-bit and
    // 64-bit formats), followed by the name padded to 4 bytes, so the
    // descriptor starts at byte 24.
    if buf.len() < 24 {
        return Err(Error::VmcoreinfoNoteInvalid);
    }
    let namesz = NativeEndian::read_u32(&buf[0..4]);
    let descsz = NativeEndian::read_u32(&buf[4..8]) as usize;
    if namesz != 11 || &buf[12..22] != b"VMCOREINFO" || descsz > buf.len() - 24 {
        return Err(Error::VmcoreinfoNoteInvalid);
    }
    Vmcoreinfo::parse(&buf[24..24 + descsz])
}
