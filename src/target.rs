pub type TargetError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Access to the target kernel's memory.
///
/// Implemented by the embedding debugger, e.g. over `/proc/kcore` for the
/// running system or over the program headers of a crash image.
pub trait TargetMemory {
    /// Read `buf.len()` bytes from the target at `address`.
    ///
    /// `physical` selects between a physical and a virtual address; virtual
    /// reads are used when walking kernel data structures, physical reads
    /// only for locating the `VMCOREINFO` note.
    fn read_memory(&self, address: u64, buf: &mut [u8], physical: bool) -> Result<(), TargetError>;

    /// Byte order of the target kernel.
    fn is_little_endian(&self) -> bool;
}

/// Placeholder target for sessions that only use the live `/proc` and `/sys`
/// backends and never read target memory.
pub struct NoTarget;

impl TargetMemory for NoTarget {
    fn read_memory(
        &self,
        _address: u64,
        _buf: &mut [u8],
        _physical: bool,
    ) -> Result<(), TargetError> {
        Err("no target memory reader was provided".into())
    }

    fn is_little_endian(&self) -> bool {
        cfg!(target_endian = "little")
    }
}
