use std::fs::File;
use std::io::{Read, Seek};
use std::path::PathBuf;

use object::{Object, ObjectSegment};

use crate::error::Error;

/// An ELF file read into memory, with the open descriptor kept around so it
/// can be handed to the debug info consumer.
pub(crate) struct OpenedElf {
    pub path: PathBuf,
    pub file: File,
    pub data: Vec<u8>,
}

/// How a candidate ELF file relates to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KernelElfKind {
    Vmlinux,
    Module,
    Other,
}

/// A kernel module carries `.gnu.linkonce.this_module`; vmlinux doesn't, but
/// it does have `.init.text`. Anything else is an ordinary file.
pub(crate) fn identify_kernel_elf(data: &[u8]) -> Result<KernelElfKind, object::read::Error> {
    let file = object::File::parse(data)?;
    if file.section_by_name(".gnu.linkonce.this_module").is_some() {
        Ok(KernelElfKind::Module)
    } else if file.section_by_name(".init.text").is_some() {
        Ok(KernelElfKind::Vmlinux)
    } else {
        Ok(KernelElfKind::Other)
    }
}

/// The address range spanned by the file's loadable segments, shifted by
/// `bias` (the KASLR offset for vmlinux). `(0, 0)` if there are none.
pub(crate) fn elf_address_range(data: &[u8], bias: u64) -> Result<(u64, u64), object::read::Error> {
    let file = object::File::parse(data)?;
    let mut start = u64::MAX;
    let mut end = 0;
    for segment in file.segments() {
        let address = segment.address();
        start = start.min(address);
        end = end.max(address.wrapping_add(segment.size()));
    }
    if start >= end {
        return Ok((0, 0));
    }
    Ok((start.wrapping_add(bias), end.wrapping_add(bias)))
}

/// Open a file and keep both the raw bytes and the descriptor.
pub(crate) fn open_elf_file(path: PathBuf) -> Result<OpenedElf, Error> {
    let file = File::open(&path).map_err(|source| Error::FileIo {
        path: path.clone(),
        source,
    })?;
    read_elf_file(path, file)
}

/// Try candidate paths in order; the first one that exists and parses as ELF
/// wins. Paths that don't exist (or can't be opened) are skipped, a file
/// that exists but isn't ELF is an error.
pub(crate) fn find_elf_file(
    candidates: impl IntoIterator<Item = PathBuf>,
) -> Result<Option<OpenedElf>, Error> {
    for path in candidates {
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                log::debug!("skipping {}: {e}", path.display());
                continue;
            }
        };
        return read_elf_file(path, file).map(Some);
    }
    Ok(None)
}

fn read_elf_file(path: PathBuf, mut file: File) -> Result<OpenedElf, Error> {
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .and_then(|_| file.rewind())
        .map_err(|source| Error::FileIo {
            path: path.clone(),
            source,
        })?;
    // Make sure it parses before anyone builds on it.
    if let Err(source) = object::File::parse(&*data) {
        return Err(Error::ObjectParse { path, source });
    }
    Ok(OpenedElf { path, file, data })
}
