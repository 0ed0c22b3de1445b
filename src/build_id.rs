use std::ops::Range;

use object::elf;
use object::read::elf::NoteIterator;
use object::Endianness;

/// Scan a blob of ELF note data for a GNU build ID and return its
/// descriptor. The data is what the kernel exposes per module: the
/// concatenated contents of one `.note.*` section, 4-byte aligned.
pub fn find_gnu_build_id(data: &[u8], endian: Endianness) -> Option<&[u8]> {
    let range = find_gnu_build_id_range(data, endian)?;
    Some(&data[range])
}

/// Like [`find_gnu_build_id`], but returns the descriptor's position so the
/// caller can keep reusing the buffer the notes were read into.
pub(crate) fn find_gnu_build_id_range(data: &[u8], endian: Endianness) -> Option<Range<usize>> {
    let mut notes = NoteIterator::<elf::FileHeader64<Endianness>>::new(endian, 4, data).ok()?;
    while let Ok(Some(note)) = notes.next() {
        if note.name() == elf::ELF_NOTE_GNU
            && note.n_type(endian) == elf::NT_GNU_BUILD_ID
            && !note.desc().is_empty()
        {
            let start = note.desc().as_ptr() as usize - data.as_ptr() as usize;
            return Some(start..start + note.desc().len());
        }
    }
    None
}

/// The byte order of the host, which is also the byte order of anything read
/// out of `/proc` and `/sys` on a live system.
pub(crate) fn native_endianness() -> Endianness {
    if cfg!(target_endian = "little") {
        Endianness::Little
    } else {
        Endianness::Big
    }
}

/// One note record for test fixtures: header, NUL-padded name, padded
/// descriptor.
#[cfg(test)]
pub(crate) fn note(namesz: u32, desc_type: u32, name: &[u8], desc: &[u8], le: bool) -> Vec<u8> {
    let word = |v: u32| if le { v.to_le_bytes() } else { v.to_be_bytes() };
    let mut out = Vec::new();
    out.extend(word(namesz));
    out.extend(word(desc.len() as u32));
    out.extend(word(desc_type));
    out.extend(name);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out.extend(desc);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}
