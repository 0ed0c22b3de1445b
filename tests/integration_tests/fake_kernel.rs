//! An in-memory kernel image with just enough typed structure to drive the
//! kernel-walk backends: a `modules` list, `struct module` entries, section
//! attributes, and note attributes, all laid out in one fake memory region.
//!
//! The layout flavor is configurable so both the modern members
//! (`core_layout`, `battr`) and their predecessors get exercised.

use kernel_debuginfo::{ObjectModel, ObjectModelError, TargetError, TargetMemory};

pub const BASE: u64 = 0xffff_ffff_c000_0000;

const HEAD_OFFSET: u64 = 0x10;
const MODULE_LIST_OFFSET: u64 = 0x8;
const MODULE_NAME_OFFSET: u64 = 0x18;
const MODULE_CORE_OFFSET: u64 = 0x60;
const MODULE_SECT_ATTRS_OFFSET: u64 = 0x80;
const MODULE_NOTES_ATTRS_OFFSET: u64 = 0x88;
const MODULE_STRUCT_SIZE: u64 = 0x100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ty {
    ListHead,
    Module,
    ModuleLayout,
    SectAttrs,
    SectAttr,
    NoteAttrs,
    NoteAttr,
    BinAttr,
    Attr,
    U64,
    CharArray,
    CharPtr,
    PtrListHead,
    PtrSectAttrs,
    PtrNoteAttrs,
}

impl Ty {
    fn pointee(self) -> Option<Ty> {
        match self {
            Ty::PtrListHead => Some(Ty::ListHead),
            Ty::PtrSectAttrs => Some(Ty::SectAttrs),
            Ty::PtrNoteAttrs => Some(Ty::NoteAttrs),
            _ => None,
        }
    }
}

/// An object in the fake target: either an lvalue at an address, or a
/// pointer rvalue.
#[derive(Clone, Debug)]
pub enum Obj {
    Ref { addr: u64, ty: Ty },
    Ptr { value: u64, ty: Ty },
}

pub struct FakeModuleSpec {
    pub name: &'static str,
    pub base: u64,
    pub size: u64,
    pub sections: Vec<(&'static str, u64)>,
    pub build_id: Option<Vec<u8>>,
}

pub struct FakeKernel {
    mem: Vec<u8>,
    head: u64,
    /// `struct module` has a `core_layout` member (v4.5+).
    new_layout: bool,
    /// Section names live behind `battr.attr.name` (v5.8+).
    battr: bool,
}

impl FakeKernel {
    pub fn new(new_layout: bool, battr: bool, modules: &[FakeModuleSpec]) -> FakeKernel {
        let mut kernel = FakeKernel {
            mem: vec![0; 0x20000],
            head: BASE + HEAD_OFFSET,
            new_layout,
            battr,
        };
        let mut cursor = 0x100u64;
        let mut alloc = |size: u64| {
            let addr = BASE + cursor;
            cursor = (cursor + size + 0xf) & !0xf;
            addr
        };

        let mut module_addrs = Vec::new();
        for spec in modules {
            let module = alloc(MODULE_STRUCT_SIZE);
            module_addrs.push(module);
            kernel.put_bytes(module + MODULE_NAME_OFFSET, spec.name.as_bytes());
            // `core_layout.base`/`.size` and `module_core`/`core_size` share
            // the same slots; only the member names differ by flavor.
            kernel.put_u64(module + MODULE_CORE_OFFSET, spec.base);
            kernel.put_u64(module + MODULE_CORE_OFFSET + 8, spec.size);

            let elem_size = kernel.elem_size(Ty::SectAttr);
            let sect_attrs = alloc(8 + spec.sections.len() as u64 * elem_size);
            kernel.put_u64(sect_attrs, spec.sections.len() as u64);
            for (i, (name, address)) in spec.sections.iter().enumerate() {
                let attr = sect_attrs + 8 + i as u64 * elem_size;
                let name_addr = alloc(name.len() as u64 + 1);
                kernel.put_bytes(name_addr, name.as_bytes());
                kernel.put_u64(attr, name_addr);
                let address_offset = if battr { 0x10 } else { 8 };
                kernel.put_u64(attr + address_offset, *address);
            }
            kernel.put_u64(module + MODULE_SECT_ATTRS_OFFSET, sect_attrs);

            let notes_attrs = match &spec.build_id {
                Some(id) => {
                    // Two note attributes; only the second carries the
                    // build ID, like a real module's notes.
                    let linux_note = elf_note(6, 0x100, b"Linux\0", &[0, 1, 0, 0]);
                    let linux_addr = alloc(linux_note.len() as u64);
                    kernel.put_bytes(linux_addr, &linux_note);
                    let id_note = elf_note(4, 3, b"GNU\0", id);
                    let id_addr = alloc(id_note.len() as u64);
                    kernel.put_bytes(id_addr, &id_note);

                    let notes_attrs = alloc(8 + 2 * 0x10);
                    kernel.put_u64(notes_attrs, 2);
                    kernel.put_u64(notes_attrs + 8, linux_addr);
                    kernel.put_u64(notes_attrs + 0x10, linux_note.len() as u64);
                    kernel.put_u64(notes_attrs + 0x18, id_addr);
                    kernel.put_u64(notes_attrs + 0x20, id_note.len() as u64);
                    notes_attrs
                }
                None => {
                    let notes_attrs = alloc(8);
                    kernel.put_u64(notes_attrs, 0);
                    notes_attrs
                }
            };
            kernel.put_u64(module + MODULE_NOTES_ATTRS_OFFSET, notes_attrs);
        }

        // Link the list: head -> module[0].list -> ... -> head.
        let list_nodes: Vec<u64> = module_addrs
            .iter()
            .map(|&m| m + MODULE_LIST_OFFSET)
            .collect();
        let mut next_of_head = kernel.head;
        if let Some(&first) = list_nodes.first() {
            next_of_head = first;
        }
        kernel.put_u64(kernel.head, next_of_head);
        for (i, &node) in list_nodes.iter().enumerate() {
            let next = list_nodes.get(i + 1).copied().unwrap_or(kernel.head);
            kernel.put_u64(node, next);
        }
        kernel
    }

    fn put_u64(&mut self, addr: u64, value: u64) {
        let offset = (addr - BASE) as usize;
        self.mem[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, addr: u64, bytes: &[u8]) {
        let offset = (addr - BASE) as usize;
        self.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn load_u64(&self, addr: u64) -> Result<u64, ObjectModelError> {
        let offset = addr
            .checked_sub(BASE)
            .filter(|o| o + 8 <= self.mem.len() as u64)
            .ok_or_else(|| other(format!("read outside fake memory: {addr:#x}")))?
            as usize;
        Ok(u64::from_le_bytes(
            self.mem[offset..offset + 8].try_into().unwrap(),
        ))
    }

    fn load_c_string(&self, addr: u64) -> Result<String, ObjectModelError> {
        let offset = addr
            .checked_sub(BASE)
            .filter(|&o| o < self.mem.len() as u64)
            .ok_or_else(|| other(format!("read outside fake memory: {addr:#x}")))?
            as usize;
        let bytes: Vec<u8> = self.mem[offset..]
            .iter()
            .copied()
            .take_while(|&b| b != 0)
            .collect();
        Ok(String::from_utf8(bytes).unwrap())
    }

    /// Resolve an object down to the pointer value it holds.
    fn pointer_value(&self, obj: &Obj) -> Result<(u64, Ty), ObjectModelError> {
        match obj {
            Obj::Ptr { value, ty } => Ok((*value, *ty)),
            Obj::Ref { addr, ty } => {
                let pointee = ty
                    .pointee()
                    .ok_or_else(|| other(format!("not a pointer: {ty:?}")))?;
                Ok((self.load_u64(*addr)?, pointee))
            }
        }
    }

    fn member_info(&self, ty: Ty, name: &str) -> Option<(u64, Ty)> {
        match (ty, name) {
            (Ty::ListHead, "next") => Some((0, Ty::PtrListHead)),
            (Ty::ListHead, "prev") => Some((8, Ty::PtrListHead)),
            (Ty::Module, "list") => Some((MODULE_LIST_OFFSET, Ty::ListHead)),
            (Ty::Module, "name") => Some((MODULE_NAME_OFFSET, Ty::CharArray)),
            (Ty::Module, "core_layout") if self.new_layout => {
                Some((MODULE_CORE_OFFSET, Ty::ModuleLayout))
            }
            (Ty::Module, "module_core") if !self.new_layout => Some((MODULE_CORE_OFFSET, Ty::U64)),
            (Ty::Module, "core_size") if !self.new_layout => {
                Some((MODULE_CORE_OFFSET + 8, Ty::U64))
            }
            (Ty::Module, "sect_attrs") => Some((MODULE_SECT_ATTRS_OFFSET, Ty::PtrSectAttrs)),
            (Ty::Module, "notes_attrs") => Some((MODULE_NOTES_ATTRS_OFFSET, Ty::PtrNoteAttrs)),
            (Ty::ModuleLayout, "base") => Some((0, Ty::U64)),
            (Ty::ModuleLayout, "size") => Some((8, Ty::U64)),
            (Ty::SectAttrs, "nsections") => Some((0, Ty::U64)),
            (Ty::SectAttrs, "attrs") => Some((8, Ty::SectAttr)),
            (Ty::SectAttr, "battr") if self.battr => Some((0, Ty::BinAttr)),
            (Ty::SectAttr, "address") if self.battr => Some((0x10, Ty::U64)),
            (Ty::SectAttr, "name") if !self.battr => Some((0, Ty::CharPtr)),
            (Ty::SectAttr, "address") if !self.battr => Some((8, Ty::U64)),
            (Ty::BinAttr, "attr") => Some((0, Ty::Attr)),
            (Ty::Attr, "name") => Some((0, Ty::CharPtr)),
            (Ty::NoteAttrs, "notes") => Some((0, Ty::U64)),
            (Ty::NoteAttrs, "attrs") => Some((8, Ty::NoteAttr)),
            (Ty::NoteAttr, "private") => Some((0, Ty::U64)),
            (Ty::NoteAttr, "size") => Some((8, Ty::U64)),
            _ => None,
        }
    }

    fn elem_size(&self, ty: Ty) -> u64 {
        match ty {
            Ty::SectAttr => {
                if self.battr {
                    0x20
                } else {
                    0x10
                }
            }
            Ty::NoteAttr => 0x10,
            _ => 8,
        }
    }
}

fn other(message: String) -> ObjectModelError {
    ObjectModelError::Other(message.into())
}

fn lookup(name: &str) -> ObjectModelError {
    ObjectModelError::Lookup(format!("no such member or object: {name}"))
}

impl ObjectModel for FakeKernel {
    type Object = Obj;
    type Type = Ty;

    fn find_type(&self, name: &str) -> Result<Ty, ObjectModelError> {
        match name {
            "struct module" => Ok(Ty::Module),
            _ => Err(lookup(name)),
        }
    }

    fn find_object(&self, name: &str) -> Result<Obj, ObjectModelError> {
        match name {
            "modules" => Ok(Obj::Ref {
                addr: self.head,
                ty: Ty::ListHead,
            }),
            _ => Err(lookup(name)),
        }
    }

    fn address_of(&self, obj: &Obj) -> Result<Obj, ObjectModelError> {
        match obj {
            Obj::Ref { addr, ty } => Ok(Obj::Ptr {
                value: *addr,
                ty: *ty,
            }),
            Obj::Ptr { .. } => Err(other("address of a value".to_string())),
        }
    }

    fn read(&self, obj: &Obj) -> Result<Obj, ObjectModelError> {
        match obj {
            Obj::Ptr { .. } => Ok(obj.clone()),
            Obj::Ref { addr, ty } => {
                let pointee = ty
                    .pointee()
                    .ok_or_else(|| other(format!("cannot read {ty:?} as a value")))?;
                Ok(Obj::Ptr {
                    value: self.load_u64(*addr)?,
                    ty: pointee,
                })
            }
        }
    }

    fn read_unsigned(&self, obj: &Obj) -> Result<u64, ObjectModelError> {
        match obj {
            Obj::Ptr { value, .. } => Ok(*value),
            Obj::Ref { addr, .. } => self.load_u64(*addr),
        }
    }

    fn read_c_string(&self, obj: &Obj) -> Result<String, ObjectModelError> {
        match obj {
            Obj::Ref {
                addr,
                ty: Ty::CharArray,
            } => self.load_c_string(*addr),
            Obj::Ref {
                addr,
                ty: Ty::CharPtr,
            } => {
                let target = self.load_u64(*addr)?;
                self.load_c_string(target)
            }
            _ => Err(other(format!("not a string: {obj:?}"))),
        }
    }

    fn member(&self, obj: &Obj, name: &str) -> Result<Obj, ObjectModelError> {
        match obj {
            Obj::Ref { addr, ty } => {
                let (offset, member_ty) = self.member_info(*ty, name).ok_or_else(|| lookup(name))?;
                Ok(Obj::Ref {
                    addr: addr + offset,
                    ty: member_ty,
                })
            }
            Obj::Ptr { .. } => Err(other(format!("member {name} of a pointer"))),
        }
    }

    fn member_dereference(&self, obj: &Obj, name: &str) -> Result<Obj, ObjectModelError> {
        let (value, pointee) = self.pointer_value(obj)?;
        let (offset, member_ty) = self
            .member_info(pointee, name)
            .ok_or_else(|| lookup(name))?;
        Ok(Obj::Ref {
            addr: value + offset,
            ty: member_ty,
        })
    }

    fn container_of(&self, ptr: &Obj, ty: &Ty, member: &str) -> Result<Obj, ObjectModelError> {
        let (value, _) = self.pointer_value(ptr)?;
        let (offset, _) = self.member_info(*ty, member).ok_or_else(|| lookup(member))?;
        Ok(Obj::Ptr {
            value: value - offset,
            ty: *ty,
        })
    }

    fn subscript(&self, obj: &Obj, index: u64) -> Result<Obj, ObjectModelError> {
        match obj {
            Obj::Ref { addr, ty } => Ok(Obj::Ref {
                addr: addr + index * self.elem_size(*ty),
                ty: *ty,
            }),
            Obj::Ptr { .. } => Err(other("subscript of a pointer".to_string())),
        }
    }
}

impl TargetMemory for FakeKernel {
    fn read_memory(&self, address: u64, buf: &mut [u8], _physical: bool) -> Result<(), TargetError> {
        let offset = address
            .checked_sub(BASE)
            .filter(|&o| o + buf.len() as u64 <= self.mem.len() as u64)
            .ok_or_else(|| format!("read outside fake memory: {address:#x}"))?
            as usize;
        buf.copy_from_slice(&self.mem[offset..offset + buf.len()]);
        Ok(())
    }

    fn is_little_endian(&self) -> bool {
        true
    }
}

/// One little-endian ELF note record.
pub fn elf_note(namesz: u32, note_type: u32, name: &[u8], desc: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(namesz.to_le_bytes());
    out.extend((desc.len() as u32).to_le_bytes());
    out.extend(note_type.to_le_bytes());
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
