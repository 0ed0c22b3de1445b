//! Lookups in `/lib/modules/$(uname -r)/modules.dep.bin`, the index depmod
//! generates over all installed kernel modules. The format is a serialized
//! radix tree and has been stable since 2009; parsing the small subset we
//! need is much cheaper than depending on libkmod.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use memmap2::Mmap;

use crate::binary_buffer::{BinaryBuffer, BufferError};
use crate::error::Error;

const DEPMOD_MAGIC: u32 = 0xb007f457;
const DEPMOD_VERSION: u32 = 0x0002_0001;

/// Node offsets are tagged: the top nibble says which parts of the node body
/// are present, the low 28 bits are the file offset.
const INDEX_NODE_MASK: u32 = 0x0fff_ffff;

bitflags! {
    #[derive(Clone, Copy)]
    struct NodeFlags: u32 {
        const PREFIX = 0x8000_0000;
        const VALUES = 0x4000_0000;
        const CHILDS = 0x2000_0000;
    }
}

/// A memory-mapped `modules.dep.bin`.
#[derive(Debug)]
pub struct DepmodIndex {
    map: Mmap,
    path: PathBuf,
}

impl DepmodIndex {
    /// Map and validate an index file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let file = std::fs::File::open(&path).map_err(|source| Error::FileIo {
            path: path.clone(),
            source,
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|source| Error::FileIo {
            path: path.clone(),
            source,
        })?;
        let index = DepmodIndex { map, path };
        index.validate()?;
        Ok(index)
    }

    /// The conventional index location for a kernel release.
    pub fn path_for_os_release(sysroot: &Path, osrelease: &str) -> PathBuf {
        sysroot.join(format!("lib/modules/{osrelease}/modules.dep.bin"))
    }

    /// Look up the path of the kernel module with the given name, relative to
    /// `/lib/modules/$(uname -r)`. Returns `Ok(None)` if the index does not
    /// contain the module; matching is byte-exact.
    pub fn find(&self, name: &str) -> Result<Option<&str>, Error> {
        let mut buffer = self.buffer();
        // validate() already checked that the header is within bounds.
        buffer.skip(8).map_err(|e| self.format_error(e))?;

        let mut name = name.as_bytes();
        let mut flags;
        loop {
            let offset = buffer.next_u32().map_err(|e| self.format_error(e))?;
            flags = NodeFlags::from_bits_truncate(offset);
            let node_offset = (offset & INDEX_NODE_MASK) as usize;
            if node_offset > self.map.len() {
                return Err(self.format_error(buffer.error("offset is out of bounds")));
            }
            buffer
                .set_pos(node_offset)
                .map_err(|e| self.format_error(e))?;

            if flags.contains(NodeFlags::PREFIX) {
                let prefix = buffer.next_string().map_err(|e| self.format_error(e))?;
                match name.strip_prefix(prefix) {
                    Some(rest) => name = rest,
                    None => return Ok(None),
                }
            }

            if flags.contains(NodeFlags::CHILDS) {
                let first = buffer.next_u8().map_err(|e| self.format_error(e))?;
                let last = buffer.next_u8().map_err(|e| self.format_error(e))?;
                if let Some((&cur, rest)) = name.split_first() {
                    if cur < first || cur > last {
                        return Ok(None);
                    }
                    buffer
                        .skip(4 * (cur - first) as usize)
                        .map_err(|e| self.format_error(e))?;
                    name = rest;
                    continue;
                } else {
                    // The child table is dense; skip past it to the values.
                    let entries = (last as usize).wrapping_sub(first as usize).wrapping_add(1);
                    buffer
                        .skip(4usize.wrapping_mul(entries))
                        .map_err(|e| self.format_error(e))?;
                    break;
                }
            } else if !name.is_empty() {
                return Ok(None);
            } else {
                break;
            }
        }

        if !flags.contains(NodeFlags::VALUES) {
            return Ok(None);
        }
        let value_count = buffer.next_u32().map_err(|e| self.format_error(e))?;
        if value_count == 0 {
            return Ok(None);
        }
        // depmod writes the highest-priority provider first; skip the
        // priority itself and return the first record's path, which runs up
        // to the ':' separating it from the dependency list.
        buffer.skip(4).map_err(|e| self.format_error(e))?;
        let rest = buffer.remaining();
        let colon = memchr::memchr(b':', rest)
            .ok_or_else(|| self.format_error(buffer.error("expected string containing ':'")))?;
        std::str::from_utf8(&rest[..colon])
            .map(Some)
            .map_err(|_| self.format_error(buffer.error("module path is not valid UTF-8")))
    }

    fn validate(&self) -> Result<(), Error> {
        let mut buffer = self.buffer();
        let magic = buffer.next_u32().map_err(|e| self.format_error(e))?;
        if magic != DEPMOD_MAGIC {
            return Err(self.format_error(buffer.error(format!("invalid magic {magic:#x}"))));
        }
        let version = buffer.next_u32().map_err(|e| self.format_error(e))?;
        if version != DEPMOD_VERSION {
            return Err(self.format_error(buffer.error(format!("unknown version {version:#x}"))));
        }
        Ok(())
    }

    fn buffer(&self) -> BinaryBuffer<'_> {
        // All integers in the index are in network byte order.
        BinaryBuffer::new(&self.map, false)
    }

    fn format_error(&self, e: BufferError) -> Error {
        Error::DepmodFormat {
            path: self.path.clone(),
            offset: e.offset,
            message: e.message.into_owned(),
        }
    }
}
