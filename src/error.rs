use std::path::PathBuf;

use thiserror::Error;

use crate::object_model::ObjectModelError;
use crate::target::TargetError;

/// The error type used in this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Could not read {path}: {source}", path = .path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("OSRELEASE in VMCOREINFO is too long")]
    VmcoreinfoOsReleaseTooLong,

    #[error("Number for {0} in VMCOREINFO is invalid")]
    VmcoreinfoInvalidNumber(&'static str),

    #[error("Number for {0} in VMCOREINFO is too large")]
    VmcoreinfoNumberOutOfRange(&'static str),

    #[error("VMCOREINFO does not contain valid {0}")]
    VmcoreinfoMissingField(&'static str),

    #[error("Could not parse /sys/kernel/vmcoreinfo")]
    SysVmcoreinfoParse,

    #[error("VMCOREINFO note is invalid")]
    VmcoreinfoNoteInvalid,

    #[error("Could not parse /proc/modules")]
    ProcModulesParse,

    #[error("Could not parse /proc/kallsyms")]
    ProcKallsymsParse,

    #[error("Could not parse {path}: expected a hex section address", path = .path.display())]
    SectionAddressParse { path: PathBuf },

    #[error("{path}: {offset:#x}: {message}", path = .path.display())]
    DepmodFormat {
        path: PathBuf,
        offset: usize,
        message: String,
    },

    #[error("Could not read target memory at {address:#x}: {source}")]
    TargetMemory {
        address: u64,
        #[source]
        source: TargetError,
    },

    #[error(transparent)]
    ObjectModel(#[from] ObjectModelError),

    #[error("Could not parse {path} as ELF: {source}", path = .path.display())]
    ObjectParse {
        path: PathBuf,
        #[source]
        source: object::read::Error,
    },

    #[error("ELF section headers are invalid: {0}")]
    ElfFormat(#[source] object::read::Error),

    #[error("Not an ELF file")]
    NotElf,

    #[error("Kernel-walk module enumeration requires an object model with vmlinux debug info")]
    NoObjectModel,

    #[error("The debug info consumer reported a fatal error: {0}")]
    Sink(#[source] TargetError),
}
