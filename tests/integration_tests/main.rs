mod fake_kernel;

use object::write::Object as WriteObject;
use object::{Architecture, BinaryFormat, Endianness, SectionKind};

use fake_kernel::elf_note;

/// A minimal kernel module ELF: executable .text, the module marker section,
/// and a GNU build ID note.
pub fn module_elf(build_id: &[u8]) -> Vec<u8> {
    let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.section_mut(text).set_data(vec![0x90; 16], 16);
    let marker = obj.add_section(
        Vec::new(),
        b".gnu.linkonce.this_module".to_vec(),
        SectionKind::Data,
    );
    obj.section_mut(marker).set_data(vec![0; 64], 8);
    let note = obj.add_section(
        Vec::new(),
        b".note.gnu.build-id".to_vec(),
        SectionKind::Note,
    );
    obj.section_mut(note)
        .set_data(elf_note(4, 3, b"GNU\0", build_id), 4);
    obj.write().unwrap()
}

/// A minimal vmlinux stand-in: has .init.text, no module marker.
pub fn vmlinux_elf() -> Vec<u8> {
    let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.section_mut(text).set_data(vec![0x90; 16], 16);
    let init = obj.add_section(Vec::new(), b".init.text".to_vec(), SectionKind::Text);
    obj.section_mut(init).set_data(vec![0x90; 16], 16);
    obj.write().unwrap()
}
