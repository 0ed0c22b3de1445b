use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};

use object::Endianness;

use crate::build_id::{find_gnu_build_id_range, native_endianness};
use crate::error::Error;
use crate::object_model::{recover_lookup, NoObjectModel, ObjectModel};
use crate::section_iter::KernelModuleSectionIter;
use crate::target::{NoTarget, TargetMemory};

/// A kernel module loaded in the target, as reported by the iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: String,
    /// Start of the module's core address range.
    pub start: u64,
    /// End of the module's core address range (exclusive).
    pub end: u64,
}

/// Enumerates the kernel modules loaded in the target.
///
/// Two backends share this interface: a live one reading `/proc/modules` and
/// `/sys/module/…`, and one that walks the kernel's `modules` list through
/// the caller's [`ObjectModel`]. The latter requires vmlinux debug info to
/// already be indexed, so that `struct module` and the `modules` list head
/// resolve.
///
/// [`gnu_build_id`](Self::gnu_build_id) and [`sections`](Self::sections)
/// operate on the module most recently returned by [`next`](Self::next).
pub struct KernelModuleIter<'a, M: ObjectModel = NoObjectModel, R: TargetMemory = NoTarget> {
    inner: Inner<'a, M, R>,
    /// Note data is re-read for every module; one buffer serves them all.
    note_buf: Vec<u8>,
}

enum Inner<'a, M: ObjectModel, R: TargetMemory> {
    Live(LiveModules),
    Walk(WalkModules<'a, M, R>),
}

struct LiveModules {
    reader: BufReader<File>,
    line: String,
    current_name: String,
    sys_module_dir: PathBuf,
}

struct WalkModules<'a, M: ObjectModel, R: TargetMemory> {
    model: &'a M,
    memory: &'a R,
    module_type: M::Type,
    /// Cursor into the `modules` list.
    node: M::Object,
    /// Address of the list head; seeing it again ends the walk.
    head: u64,
    /// Pointer to the current `struct module`.
    current: Option<M::Object>,
}

impl<'a, M: ObjectModel, R: TargetMemory> KernelModuleIter<'a, M, R> {
    /// Enumerate through `/proc/modules` and `/sys/module/…`.
    pub fn new_live() -> Result<Self, Error> {
        Self::new_live_at(Path::new("/proc/modules"), PathBuf::from("/sys/module"))
    }

    pub(crate) fn new_live_at(proc_modules: &Path, sys_module_dir: PathBuf) -> Result<Self, Error> {
        let file = File::open(proc_modules).map_err(|source| Error::FileIo {
            path: proc_modules.to_owned(),
            source,
        })?;
        Ok(KernelModuleIter {
            inner: Inner::Live(LiveModules {
                reader: BufReader::new(file),
                line: String::new(),
                current_name: String::new(),
                sys_module_dir,
            }),
            note_buf: Vec::new(),
        })
    }

    /// Enumerate by walking the kernel's module list through typed reads.
    pub fn new_walk(model: &'a M, memory: &'a R) -> Result<Self, Error> {
        let module_type = model.find_type("struct module")?;
        let node = model.find_object("modules")?;
        let node = model.address_of(&node)?;
        let node = model.read(&node)?;
        let head = model.read_unsigned(&node)?;
        Ok(KernelModuleIter {
            inner: Inner::Walk(WalkModules {
                model,
                memory,
                module_type,
                node,
                head,
                current: None,
            }),
            note_buf: Vec::new(),
        })
    }

    /// The next loaded module, or `Ok(None)` after the last one. The
    /// returned range satisfies `start <= end`.
    pub fn next(&mut self) -> Result<Option<LoadedModule>, Error> {
        match &mut self.inner {
            Inner::Live(live) => live.next(),
            Inner::Walk(walk) => walk.next(),
        }
    }

    /// The GNU build ID of the current module, or `Ok(None)` if it has none.
    ///
    /// Panics if called before [`next`](Self::next) returned a module.
    pub fn gnu_build_id(&mut self) -> Result<Option<&[u8]>, Error> {
        let range = match &mut self.inner {
            Inner::Live(live) => {
                let notes_dir = live.sys_module_dir.join(&live.current_name).join("notes");
                live_gnu_build_id(&notes_dir, &mut self.note_buf)?
            }
            Inner::Walk(walk) => walk.gnu_build_id(&mut self.note_buf)?,
        };
        Ok(range.map(|range| &self.note_buf[range]))
    }

    /// Iterate over the current module's sections.
    ///
    /// Panics if called before [`next`](Self::next) returned a module.
    pub fn sections(&mut self) -> Result<KernelModuleSectionIter<'_, M>, Error> {
        match &mut self.inner {
            Inner::Live(live) => {
                let dir = live.sys_module_dir.join(&live.current_name).join("sections");
                KernelModuleSectionIter::open_live(dir)
            }
            Inner::Walk(walk) => {
                let module = walk.current.as_ref().expect("no current module");
                let sect_attrs = walk.model.member_dereference(module, "sect_attrs")?;
                let nsections_obj = walk.model.member_dereference(&sect_attrs, "nsections")?;
                let nsections = walk.model.read_unsigned(&nsections_obj)?;
                let attrs = walk.model.member_dereference(&sect_attrs, "attrs")?;
                Ok(KernelModuleSectionIter::walk(walk.model, attrs, nsections))
            }
        }
    }
}

impl LiveModules {
    fn next(&mut self) -> Result<Option<LoadedModule>, Error> {
        self.line.clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .map_err(|source| Error::FileIo {
                path: PathBuf::from("/proc/modules"),
                source,
            })?;
        if n == 0 {
            return Ok(None);
        }
        let module = parse_proc_modules_line(&self.line).ok_or(Error::ProcModulesParse)?;
        self.current_name.clone_from(&module.name);
        Ok(Some(module))
    }
}

/// "NAME SIZE REFCNT USERS STATE ADDRESS …" with the size in decimal and the
/// address in hex.
fn parse_proc_modules_line(line: &str) -> Option<LoadedModule> {
    let mut fields = line.split_ascii_whitespace();
    let name = fields.next()?;
    let size: u64 = fields.next()?.parse().ok()?;
    fields.next()?; // reference count
    fields.next()?; // users
    fields.next()?; // state
    let address = fields.next()?;
    let address = address.strip_prefix("0x").unwrap_or(address);
    let start = u64::from_str_radix(address, 16).ok()?;
    let end = start.checked_add(size)?;
    Some(LoadedModule {
        name: name.to_owned(),
        start,
        end,
    })
}

impl<'a, M: ObjectModel, R: TargetMemory> WalkModules<'a, M, R> {
    fn next(&mut self) -> Result<Option<LoadedModule>, Error> {
        let node = self.model.member_dereference(&self.node, "next")?;
        let node = self.model.read(&node)?;
        let addr = self.model.read_unsigned(&node)?;
        self.node = node;
        if addr == self.head {
            return Ok(None);
        }

        let module = self
            .model
            .container_of(&self.node, &self.module_type, "list")?;

        // Since v4.5 the base and size live in the `struct module_layout
        // core_layout` member; before that they are directly in
        // `struct module`.
        let (base_obj, size_obj) =
            match recover_lookup(self.model.member_dereference(&module, "core_layout"))? {
                Some(layout) => (
                    self.model.member(&layout, "base")?,
                    self.model.member(&layout, "size")?,
                ),
                None => (
                    self.model.member_dereference(&module, "module_core")?,
                    self.model.member_dereference(&module, "core_size")?,
                ),
            };
        let start = self.model.read_unsigned(&base_obj)?;
        let size = self.model.read_unsigned(&size_obj)?;

        let name_obj = self.model.member_dereference(&module, "name")?;
        let name = self.model.read_c_string(&name_obj)?;

        self.current = Some(module);
        Ok(Some(LoadedModule {
            name,
            start,
            end: start.wrapping_add(size),
        }))
    }

    /// Read `mod->notes_attrs->attrs[0..notes]` out of target memory and
    /// scan each attribute's note data for the build ID.
    fn gnu_build_id(&mut self, buf: &mut Vec<u8>) -> Result<Option<Range<usize>>, Error> {
        let module = self.current.as_ref().expect("no current module");
        let endian = if self.memory.is_little_endian() {
            Endianness::Little
        } else {
            Endianness::Big
        };

        let notes_attrs = self.model.member_dereference(module, "notes_attrs")?;
        let notes_obj = self.model.member_dereference(&notes_attrs, "notes")?;
        let n = self.model.read_unsigned(&notes_obj)?;
        let attrs = self.model.member_dereference(&notes_attrs, "attrs")?;

        for i in 0..n {
            let attr = self.model.subscript(&attrs, i)?;
            let private_obj = self.model.member(&attr, "private")?;
            let address = self.model.read_unsigned(&private_obj)?;
            let size_obj = self.model.member(&attr, "size")?;
            let size = self.model.read_unsigned(&size_obj)?;

            buf.clear();
            buf.resize(size as usize, 0);
            self.memory
                .read_memory(address, buf, false)
                .map_err(|source| Error::TargetMemory { address, source })?;

            if let Some(range) = find_gnu_build_id_range(buf, endian) {
                return Ok(Some(range));
            }
        }
        Ok(None)
    }
}

/// Read every regular file under `/sys/module/NAME/notes/` and scan it for
/// the build ID, reusing `buf` across files.
fn live_gnu_build_id(notes_dir: &Path, buf: &mut Vec<u8>) -> Result<Option<Range<usize>>, Error> {
    let entries = std::fs::read_dir(notes_dir).map_err(|source| Error::FileIo {
        path: notes_dir.to_owned(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| Error::FileIo {
            path: notes_dir.to_owned(),
            source,
        })?;
        let file_type = entry.file_type().map_err(|source| Error::FileIo {
            path: entry.path(),
            source,
        })?;
        if file_type.is_dir() {
            continue;
        }

        buf.clear();
        let path = entry.path();
        File::open(&path)
            .and_then(|mut file| file.read_to_end(buf))
            .map_err(|source| Error::FileIo { path, source })?;

        if let Some(range) = find_gnu_build_id_range(buf, native_endianness()) {
            return Ok(Some(range));
        }
    }
    Ok(None)
}
