use std::fs::ReadDir;
use std::marker::PhantomData;
use std::path::PathBuf;

use crate::error::Error;
use crate::object_model::{recover_lookup, ObjectModel};

/// One section of a loaded kernel module: the section name and the virtual
/// address it was placed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub address: u64,
}

/// Iterates over the sections of the module most recently returned by a
/// [`KernelModuleIter`](crate::KernelModuleIter). Obtained from
/// [`KernelModuleIter::sections`](crate::KernelModuleIter::sections); the
/// module iterator cannot advance while this is alive.
pub struct KernelModuleSectionIter<'it, M: ObjectModel> {
    inner: SectionIterInner<'it, M>,
    _parent: PhantomData<&'it mut ()>,
}

enum SectionIterInner<'it, M: ObjectModel> {
    Live {
        dir: PathBuf,
        entries: ReadDir,
    },
    Walk {
        model: &'it M,
        /// `mod->sect_attrs->attrs`.
        attrs: M::Object,
        nsections: u64,
        index: u64,
    },
}

impl<'it, M: ObjectModel> KernelModuleSectionIter<'it, M> {
    pub(crate) fn open_live(dir: PathBuf) -> Result<Self, Error> {
        let entries = std::fs::read_dir(&dir).map_err(|source| Error::FileIo {
            path: dir.clone(),
            source,
        })?;
        Ok(KernelModuleSectionIter {
            inner: SectionIterInner::Live { dir, entries },
            _parent: PhantomData,
        })
    }

    pub(crate) fn walk(model: &'it M, attrs: M::Object, nsections: u64) -> Self {
        KernelModuleSectionIter {
            inner: SectionIterInner::Walk {
                model,
                attrs,
                nsections,
                index: 0,
            },
            _parent: PhantomData,
        }
    }

    /// The next section, or `Ok(None)` when all sections have been listed.
    pub fn next(&mut self) -> Result<Option<Section>, Error> {
        match &mut self.inner {
            SectionIterInner::Live { dir, entries } => next_live(dir, entries),
            SectionIterInner::Walk {
                model,
                attrs,
                nsections,
                index,
            } => next_walk(*model, attrs, *nsections, index),
        }
    }
}

/// Each regular file under `/sys/module/NAME/sections/` is one section; its
/// contents is the load address as a single hex number. Entry order is
/// whatever the filesystem returns.
fn next_live(dir: &PathBuf, entries: &mut ReadDir) -> Result<Option<Section>, Error> {
    for entry in entries {
        let entry = entry.map_err(|source| Error::FileIo {
            path: dir.clone(),
            source,
        })?;
        // file_type() stats when the directory entry doesn't say.
        let file_type = entry.file_type().map_err(|source| Error::FileIo {
            path: entry.path(),
            source,
        })?;
        if file_type.is_dir() {
            continue;
        }
        let path = entry.path();
        let contents = std::fs::read_to_string(&path).map_err(|source| Error::FileIo {
            path: path.clone(),
            source,
        })?;
        let address = contents
            .split_whitespace()
            .next()
            .and_then(|word| {
                let word = word.strip_prefix("0x").unwrap_or(word);
                u64::from_str_radix(word, 16).ok()
            })
            .ok_or(Error::SectionAddressParse { path })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        return Ok(Some(Section { name, address }));
    }
    Ok(None)
}

fn next_walk<M: ObjectModel>(
    model: &M,
    attrs: &M::Object,
    nsections: u64,
    index: &mut u64,
) -> Result<Option<Section>, Error> {
    if *index >= nsections {
        return Ok(None);
    }
    let attr = model.subscript(attrs, *index)?;
    *index += 1;

    let address_obj = model.member(&attr, "address")?;
    let address = model.read_unsigned(&address_obj)?;

    // Since v5.8 the section name lives in module_sect_attr.battr.attr.name;
    // before that it is module_sect_attr.name.
    let name_holder = match recover_lookup(model.member(&attr, "battr"))? {
        Some(battr) => model.member(&battr, "attr")?,
        None => attr,
    };
    let name_obj = model.member(&name_holder, "name")?;
    let name = model.read_c_string(&name_obj)?;

    Ok(Some(Section { name, address }))
}
