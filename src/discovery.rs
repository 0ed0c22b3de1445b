use std::fs::File;
use std::path::PathBuf;

use debugid::CodeId;
use object::Object;
use rustc_hash::FxHashMap;

use crate::depmod::DepmodIndex;
use crate::elf_file::{
    elf_address_range, find_elf_file, identify_kernel_elf, open_elf_file, KernelElfKind, OpenedElf,
};
use crate::error::Error;
use crate::module_iter::{KernelModuleIter, LoadedModule};
use crate::object_model::ObjectModel;
use crate::section_patch::patch_module_sections;
use crate::target::{TargetError, TargetMemory};
use crate::vmcoreinfo::Vmcoreinfo;

/// Overrides the live fast path: when this is set to something that parses
/// to zero, modules are enumerated by walking kernel memory even on a live
/// system.
pub const USE_PROC_AND_SYS_ENV: &str = "DRGN_USE_PROC_AND_SYS_MODULES";

/// An ELF file being handed over to the debug info consumer, together with
/// the address range it occupies in the target (`[0, 0]` for files that are
/// not loaded).
///
/// `data` holds the entire file, with the runtime section addresses already
/// patched in for kernel modules; `file` is the open descriptor, positioned
/// at the start. Both belong to the consumer from here on.
pub struct ElfReport {
    pub path: PathBuf,
    pub file: File,
    pub data: Vec<u8>,
    pub start: u64,
    pub end: u64,
    /// Module name, `"kernel"` for vmlinux, or the file path for files that
    /// are not loaded in the target. `None` for files that are neither
    /// vmlinux nor a kernel module.
    pub name: Option<String>,
}

/// The debug info consumer: typically a DWARF indexer. Any `Err` from these
/// methods aborts the whole discovery run.
pub trait DebugInfoSink {
    /// Take ownership of a file. Returns whether the file was newly added.
    fn report_elf(&mut self, report: ElfReport) -> Result<bool, TargetError>;

    /// Record a non-fatal problem with one file or module. `Ok(())` means
    /// "noted, keep going".
    fn report_error(
        &mut self,
        name: Option<&str>,
        message: &str,
        cause: Option<Error>,
    ) -> Result<(), TargetError>;

    /// Index everything reported so far. Called before the module walk needs
    /// `struct module` from vmlinux.
    fn flush(&mut self) -> Result<(), TargetError>;

    /// Whether debug info for the named module is already indexed.
    fn is_indexed(&self, name: &str) -> bool;
}

/// What to load in one discovery run.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    /// Caller-supplied candidate ELF files: vmlinux builds, module files,
    /// or anything else worth indexing.
    pub paths: Vec<PathBuf>,
    /// Search the standard locations for vmlinux if no candidate covers it.
    pub load_main: bool,
    /// Resolve modules with no matching candidate through depmod.
    pub load_default: bool,
}

/// Environment of a discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Whether the target is the running kernel. Only live targets may use
    /// the `/proc` + `/sys` fast path.
    pub live: bool,
    /// Prepended to `/lib/modules` and `/usr/lib/debug` lookups. "/" outside
    /// of tests.
    pub sysroot: PathBuf,
    /// Overrides the [`USE_PROC_AND_SYS_ENV`] environment variable.
    pub use_proc_and_sys: Option<bool>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            live: false,
            sysroot: PathBuf::from("/"),
            use_proc_and_sys: None,
        }
    }
}

/// A candidate module file, waiting for the loaded module with its build ID.
struct Candidate {
    path: PathBuf,
    file: File,
    data: Vec<u8>,
}

/// Chains of candidates sharing a GNU build ID, in insertion order.
type CandidateTable = FxHashMap<Vec<u8>, Vec<Candidate>>;

enum DepmodState {
    Disabled,
    Uninit,
    Ready(DepmodIndex),
    Failed,
}

/// Locates debug info for the target kernel and its loaded modules and
/// reports every file to the [`DebugInfoSink`].
///
/// Caller-supplied module files are matched to loaded modules by GNU build
/// ID; for everything else the `depmod` index points at the installed module
/// files. Supplied files whose build ID no loaded module reports are still
/// handed over, at address range `[0, 0]`, so their types resolve.
pub struct DebugInfoDiscovery<'a, M: ObjectModel, R: TargetMemory, S: DebugInfoSink> {
    vmcoreinfo: &'a Vmcoreinfo,
    model: Option<&'a M>,
    memory: &'a R,
    sink: &'a mut S,
    config: DiscoveryConfig,
}

impl<'a, M: ObjectModel, R: TargetMemory, S: DebugInfoSink> DebugInfoDiscovery<'a, M, R, S> {
    /// `model` may be `None` for live targets that stick to the fast path;
    /// kernel-walk enumeration fails without it.
    pub fn new(
        vmcoreinfo: &'a Vmcoreinfo,
        model: Option<&'a M>,
        memory: &'a R,
        sink: &'a mut S,
        config: DiscoveryConfig,
    ) -> Self {
        DebugInfoDiscovery {
            vmcoreinfo,
            model,
            memory,
            sink,
            config,
        }
    }

    /// Run discovery: classify the supplied files, make sure vmlinux is
    /// reported, then enumerate loaded modules and resolve each one.
    pub fn report_debug_info(&mut self, request: &LoadRequest) -> Result<(), Error> {
        // Kernel modules are set aside; vmlinux may have to be indexed
        // before they can be reported.
        let mut kmods = Vec::new();
        let mut vmlinux_is_pending = false;

        for path in &request.paths {
            let opened = match open_elf_file(path.clone()) {
                Ok(opened) => opened,
                Err(err) => {
                    self.report_error(
                        Some(&path.to_string_lossy()),
                        "could not read file",
                        Some(err),
                    )?;
                    continue;
                }
            };
            match identify_kernel_elf(&opened.data) {
                Ok(KernelElfKind::Module) => kmods.push(Candidate {
                    path: opened.path,
                    file: opened.file,
                    data: opened.data,
                }),
                Ok(KernelElfKind::Vmlinux) => {
                    let range = elf_address_range(&opened.data, self.vmcoreinfo.kaslr_offset);
                    let (start, end) = match range {
                        Ok(range) => range,
                        Err(source) => {
                            self.report_error(
                                Some(&path.to_string_lossy()),
                                "could not get address range",
                                Some(Error::ObjectParse {
                                    path: path.clone(),
                                    source,
                                }),
                            )?;
                            continue;
                        }
                    };
                    let is_new = self.report_elf(opened, start, end, Some("kernel".to_owned()))?;
                    if is_new {
                        vmlinux_is_pending = true;
                    }
                }
                Ok(KernelElfKind::Other) => {
                    self.report_elf(opened, 0, 0, None)?;
                }
                Err(source) => {
                    self.report_error(
                        Some(&path.to_string_lossy()),
                        "could not identify file",
                        Some(Error::ObjectParse {
                            path: path.clone(),
                            source,
                        }),
                    )?;
                }
            }
        }

        if request.load_main && !vmlinux_is_pending && !self.sink.is_indexed("kernel") {
            vmlinux_is_pending = self.report_vmlinux()?;
        }

        self.report_kernel_modules(request, kmods, vmlinux_is_pending)
    }

    /// Look for vmlinux at the standard locations. The files under
    /// /usr/lib/debug should always have debug information, so those come
    /// first. Returns whether a new vmlinux was reported.
    fn report_vmlinux(&mut self) -> Result<bool, Error> {
        let release = &self.vmcoreinfo.osrelease;
        let candidates = [
            format!("usr/lib/debug/boot/vmlinux-{release}"),
            format!("usr/lib/debug/lib/modules/{release}/vmlinux"),
            format!("boot/vmlinux-{release}"),
            format!("lib/modules/{release}/build/vmlinux"),
            format!("lib/modules/{release}/vmlinux"),
        ];
        let sysroot = self.config.sysroot.clone();
        let opened = match find_elf_file(candidates.iter().map(|p| sysroot.join(p))) {
            Ok(Some(opened)) => opened,
            Ok(None) => {
                let message = format!("could not find vmlinux for {release}");
                self.report_error(Some("kernel"), &message, None)?;
                return Ok(false);
            }
            Err(err) => {
                self.report_error(Some("kernel"), "could not read vmlinux", Some(err))?;
                return Ok(false);
            }
        };

        let (start, end) = match elf_address_range(&opened.data, self.vmcoreinfo.kaslr_offset) {
            Ok(range) => range,
            Err(source) => {
                let err = Error::ObjectParse {
                    path: opened.path.clone(),
                    source,
                };
                self.report_error(
                    Some(&opened.path.to_string_lossy()),
                    "could not get address range",
                    Some(err),
                )?;
                return Ok(false);
            }
        };
        log::debug!("found vmlinux at {}", opened.path.display());
        self.report_elf(opened, start, end, Some("kernel".to_owned()))
    }

    fn report_kernel_modules(
        &mut self,
        request: &LoadRequest,
        kmods: Vec<Candidate>,
        vmlinux_is_pending: bool,
    ) -> Result<(), Error> {
        if kmods.is_empty() && !request.load_default {
            return Ok(());
        }

        // On a live system the loaded modules can come from /proc and /sys
        // instead of from target memory; an environment variable can turn
        // that off for testing.
        let use_proc_and_sys = self.config.live
            && self.config.use_proc_and_sys.unwrap_or_else(|| {
                match std::env::var(USE_PROC_AND_SYS_ENV) {
                    Ok(value) => value.trim().parse::<i64>().map(|n| n != 0).unwrap_or(false),
                    Err(_) => true,
                }
            });

        // The kernel walk resolves `struct module` through vmlinux debug
        // info, so a newly reported vmlinux must be indexed first.
        if vmlinux_is_pending && !use_proc_and_sys {
            self.sink.flush().map_err(Error::Sink)?;
        }

        let have_candidates = !kmods.is_empty();
        let mut table = CandidateTable::default();
        for kmod in kmods {
            let build_id = object::File::parse(&*kmod.data)
                .ok()
                .and_then(|file| file.build_id().ok().flatten().map(<[u8]>::to_vec));
            match build_id {
                Some(id) if !id.is_empty() => table.entry(id).or_default().push(kmod),
                _ => {
                    self.report_error(
                        Some(&kmod.path.to_string_lossy()),
                        "could not find GNU build ID",
                        None,
                    )?;
                }
            }
        }

        let mut depmod = if request.load_default {
            DepmodState::Uninit
        } else {
            DepmodState::Disabled
        };
        self.report_loaded_kernel_modules(
            &mut table,
            &mut depmod,
            use_proc_and_sys,
            have_candidates,
        )?;

        // Anything left over was not loaded; report it at address zero so
        // its types still resolve.
        for (build_id, chain) in table.drain() {
            log::debug!(
                "{} supplied file(s) with build ID {} matched no loaded module",
                chain.len(),
                CodeId::from_binary(&build_id)
            );
            for kmod in chain {
                let name = kmod.path.to_string_lossy().into_owned();
                self.report_elf(
                    OpenedElf {
                        path: kmod.path,
                        file: kmod.file,
                        data: kmod.data,
                    },
                    0,
                    0,
                    Some(name),
                )?;
            }
        }
        Ok(())
    }

    fn report_loaded_kernel_modules(
        &mut self,
        table: &mut CandidateTable,
        depmod: &mut DepmodState,
        use_proc_and_sys: bool,
        have_candidates: bool,
    ) -> Result<(), Error> {
        let mut iter: KernelModuleIter<'a, M, R> = if use_proc_and_sys {
            match KernelModuleIter::new_live() {
                Ok(iter) => iter,
                Err(err) => return self.report_modules_unavailable(err),
            }
        } else {
            let Some(model) = self.model else {
                return self.report_modules_unavailable(Error::NoObjectModel);
            };
            match KernelModuleIter::new_walk(model, self.memory) {
                Ok(iter) => iter,
                Err(err) => return self.report_modules_unavailable(err),
            }
        };

        loop {
            let module = match iter.next() {
                Ok(Some(module)) => module,
                Ok(None) => return Ok(()),
                Err(err) => return self.report_modules_unavailable(err),
            };

            // A caller-supplied file matched by build ID takes precedence.
            if have_candidates && self.report_loaded_kernel_module(&mut iter, &module, table)? {
                continue;
            }

            // Fall back to the standard locations, unless this module is
            // already covered.
            if matches!(depmod, DepmodState::Disabled | DepmodState::Failed)
                || self.sink.is_indexed(&module.name)
            {
                continue;
            }
            if matches!(depmod, DepmodState::Uninit) {
                let path =
                    DepmodIndex::path_for_os_release(&self.config.sysroot, &self.vmcoreinfo.osrelease);
                match DepmodIndex::open(path) {
                    Ok(index) => *depmod = DepmodState::Ready(index),
                    Err(err) => {
                        // Don't retry for every remaining module.
                        *depmod = DepmodState::Failed;
                        self.report_error(
                            Some("kernel modules"),
                            "could not read depmod",
                            Some(err),
                        )?;
                        continue;
                    }
                }
            }
            if let DepmodState::Ready(index) = depmod {
                self.report_default_kernel_module(&mut iter, &module, index)?;
            }
        }
    }

    /// Patch and report every supplied file chained under the module's build
    /// ID. Returns whether the module was handled (matched, in which case
    /// the chain is consumed).
    fn report_loaded_kernel_module(
        &mut self,
        iter: &mut KernelModuleIter<'a, M, R>,
        module: &LoadedModule,
        table: &mut CandidateTable,
    ) -> Result<bool, Error> {
        let build_id = match iter.gnu_build_id() {
            Ok(Some(id)) => id.to_vec(),
            Ok(None) => {
                self.report_error(Some(&module.name), "could not find GNU build ID", None)?;
                return Ok(false);
            }
            Err(err) => {
                self.report_error(Some(&module.name), "could not find GNU build ID", Some(err))?;
                return Ok(false);
            }
        };

        let Some(chain) = table.remove(build_id.as_slice()) else {
            return Ok(false);
        };
        log::debug!(
            "module {} matches {} supplied file(s) with build ID {}",
            module.name,
            chain.len(),
            CodeId::from_binary(&build_id)
        );
        for mut kmod in chain {
            let patched = iter
                .sections()
                .and_then(|mut sections| patch_module_sections(&mut sections, &mut kmod.data));
            if let Err(err) = patched {
                self.report_error(
                    Some(&kmod.path.to_string_lossy()),
                    "could not get section addresses",
                    Some(err),
                )?;
                continue;
            }
            self.report_elf(
                OpenedElf {
                    path: kmod.path,
                    file: kmod.file,
                    data: kmod.data,
                },
                module.start,
                module.end,
                Some(module.name.clone()),
            )?;
        }
        Ok(true)
    }

    /// Resolve a module through depmod and the standard file locations.
    fn report_default_kernel_module(
        &mut self,
        iter: &mut KernelModuleIter<'a, M, R>,
        module: &LoadedModule,
        index: &DepmodIndex,
    ) -> Result<(), Error> {
        let depmod_path = match index.find(&module.name) {
            Ok(Some(path)) => path.to_owned(),
            Ok(None) => {
                self.report_error(Some(&module.name), "could not find module in depmod", None)?;
                return Ok(());
            }
            Err(err) => {
                self.report_error(Some("kernel modules"), "could not parse depmod", Some(err))?;
                return Ok(());
            }
        };

        // Compressed modules ship as foo.ko.gz/.xz; the debug variants in
        // /usr/lib/debug are never compressed.
        let (without_ext, ext) = match depmod_path.rsplit_once('.') {
            Some((stem, "gz" | "xz")) => (stem, &depmod_path[stem.len()..]),
            _ => (depmod_path.as_str(), ""),
        };
        let release = &self.vmcoreinfo.osrelease;
        let candidates = [
            format!("usr/lib/debug/lib/modules/{release}/{without_ext}"),
            format!("usr/lib/debug/lib/modules/{release}/{without_ext}.debug"),
            format!("lib/modules/{release}/{without_ext}{ext}"),
        ];
        let sysroot = self.config.sysroot.clone();
        let mut opened = match find_elf_file(candidates.iter().map(|p| sysroot.join(p))) {
            Ok(Some(opened)) => opened,
            Ok(None) => {
                self.report_error(Some(&module.name), "could not find .ko", None)?;
                return Ok(());
            }
            Err(err) => {
                self.report_error(Some(&module.name), "could not read module file", Some(err))?;
                return Ok(());
            }
        };

        let patched = iter
            .sections()
            .and_then(|mut sections| patch_module_sections(&mut sections, &mut opened.data));
        if let Err(err) = patched {
            self.report_error(
                Some(&opened.path.to_string_lossy()),
                "could not get section addresses",
                Some(err),
            )?;
            return Ok(());
        }
        self.report_elf(opened, module.start, module.end, Some(module.name.clone()))?;
        Ok(())
    }

    fn report_modules_unavailable(&mut self, err: Error) -> Result<(), Error> {
        self.report_error(
            Some("kernel modules"),
            "could not find loaded kernel modules",
            Some(err),
        )
    }

    fn report_elf(
        &mut self,
        opened: OpenedElf,
        start: u64,
        end: u64,
        name: Option<String>,
    ) -> Result<bool, Error> {
        self.sink
            .report_elf(ElfReport {
                path: opened.path,
                file: opened.file,
                data: opened.data,
                start,
                end,
                name,
            })
            .map_err(Error::Sink)
    }

    fn report_error(
        &mut self,
        name: Option<&str>,
        message: &str,
        cause: Option<Error>,
    ) -> Result<(), Error> {
        self.sink
            .report_error(name, message, cause)
            .map_err(Error::Sink)
    }
}
