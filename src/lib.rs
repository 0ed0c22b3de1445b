//! Discovery of debug info files for a live or crashed Linux kernel and its
//! loaded modules.
//!
//! The entry point is [`DebugInfoDiscovery`]: give it the target's parsed
//! [`Vmcoreinfo`], a [`TargetMemory`] reader, optionally an [`ObjectModel`]
//! backed by vmlinux debug info, and a [`DebugInfoSink`] that consumes the
//! located files. One [`report_debug_info`](DebugInfoDiscovery::report_debug_info)
//! call then:
//!
//! - classifies the caller's candidate ELF files as vmlinux, kernel module,
//!   or other,
//! - makes sure vmlinux is reported (searching the standard locations if no
//!   candidate covers it),
//! - enumerates the loaded kernel modules, through `/proc/modules` and
//!   `/sys/module/…` on a live system or by walking the kernel's `modules`
//!   list through the object model, and
//! - resolves each loaded module to a file: candidates are matched by GNU
//!   build ID, everything else goes through the `depmod` index
//!   (`modules.dep.bin`) and the standard debug file locations.
//!
//! Before a module file is handed to the sink, the addresses the kernel
//! loaded its sections at are patched into the file's section headers, so a
//! DWARF consumer resolves symbols at their true runtime addresses.
//!
//! # Design constraints
//!
//! This crate operates under the following design constraints:
//!
//!   - No policy decisions: which files to index, how to store them, and
//!     when to give up are the embedding debugger's calls. The sink hears
//!     about every file and every per-file failure and decides what is
//!     fatal.
//!   - Kernel version tolerance: the layouts this crate touches
//!     (`struct module`, section and note attributes) have changed over the
//!     years; member lookups fall back across those changes rather than
//!     assuming one layout.
//!   - Deterministic teardown: files and mappings are owned by exactly one
//!     structure, and ownership of reported files moves to the sink. An
//!     aborted run leaks nothing.

mod binary_buffer;
mod build_id;
mod depmod;
mod discovery;
mod elf_file;
mod error;
pub mod kallsyms;
mod module_iter;
mod object_model;
mod section_iter;
mod section_patch;
mod target;
mod vmcoreinfo;

pub use binary_buffer::{BinaryBuffer, BufferError};
pub use build_id::find_gnu_build_id;
pub use depmod::DepmodIndex;
pub use discovery::{
    DebugInfoDiscovery, DebugInfoSink, DiscoveryConfig, ElfReport, LoadRequest,
    USE_PROC_AND_SYS_ENV,
};
pub use error::Error;
pub use module_iter::{KernelModuleIter, LoadedModule};
pub use object_model::{NoObjectModel, ObjectModel, ObjectModelError};
pub use section_iter::{KernelModuleSectionIter, Section};
pub use target::{NoTarget, TargetError, TargetMemory};
pub use vmcoreinfo::{read_vmcoreinfo_fallback, Vmcoreinfo};
