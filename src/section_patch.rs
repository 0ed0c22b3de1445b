use object::read::elf::{FileHeader, SectionHeader};
use object::{elf, Endianness, FileKind, U32, U64};
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::object_model::ObjectModel;
use crate::section_iter::KernelModuleSectionIter;

/// Drain the section iterator and patch the reported runtime addresses into
/// the module ELF's section headers, so that the debug info consumer sees
/// symbols at the addresses the kernel actually placed them at.
pub(crate) fn patch_module_sections<M: ObjectModel>(
    sections: &mut KernelModuleSectionIter<'_, M>,
    data: &mut [u8],
) -> Result<(), Error> {
    let mut runtime_addresses = FxHashMap::default();
    while let Some(section) = sections.next()? {
        runtime_addresses.insert(section.name, section.address);
    }
    patch_section_addresses(data, &runtime_addresses)
}

/// Overwrite `sh_addr` of every allocated section whose name appears in
/// `addresses`. Sections the kernel didn't report keep their on-disk
/// address; runtime names with no on-disk section are ignored.
pub(crate) fn patch_section_addresses(
    data: &mut [u8],
    addresses: &FxHashMap<String, u64>,
) -> Result<(), Error> {
    match FileKind::parse(&*data).map_err(Error::ElfFormat)? {
        FileKind::Elf64 => patch_impl::<elf::FileHeader64<Endianness>>(data, addresses),
        FileKind::Elf32 => patch_impl::<elf::FileHeader32<Endianness>>(data, addresses),
        _ => Err(Error::NotElf),
    }
}

fn patch_impl<Elf: FileHeader<Endian = Endianness>>(
    data: &mut [u8],
    addresses: &FxHashMap<String, u64>,
) -> Result<(), Error> {
    let shentsize = std::mem::size_of::<Elf::SectionHeader>();
    let (endian, e_shoff, is_64, patches) = {
        let header = Elf::parse(&*data).map_err(Error::ElfFormat)?;
        let endian = header.endian().map_err(Error::ElfFormat)?;
        let sections = header.sections(endian, &*data).map_err(Error::ElfFormat)?;
        let mut patches = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            let flags: u64 = section.sh_flags(endian).into();
            if flags & u64::from(elf::SHF_ALLOC) == 0 {
                continue;
            }
            let name = sections
                .section_name(endian, section)
                .map_err(Error::ElfFormat)?;
            let Ok(name) = std::str::from_utf8(name) else {
                continue;
            };
            if let Some(&address) = addresses.get(name) {
                patches.push((i, address));
            }
        }
        let e_shoff: u64 = header.e_shoff(endian).into();
        (endian, e_shoff as usize, header.is_type_64(), patches)
    };

    // The section table was successfully parsed out of `data` above, so each
    // header slot is in bounds. sh_addr sits after sh_name, sh_type, and
    // sh_flags.
    for (i, address) in patches {
        let header_offset = e_shoff + i * shentsize;
        if is_64 {
            let field = header_offset + 16;
            data[field..field + 8].copy_from_slice(object::pod::bytes_of(&U64::new(endian, address)));
        } else {
            let field = header_offset + 12;
            data[field..field + 4]
                .copy_from_slice(object::pod::bytes_of(&U32::new(endian, address as u32)));
        }
    }
    Ok(())
}
