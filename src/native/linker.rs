//! Dynamic linking of the engine module.
//!
//! [`Linker`] is the seam between the loader's state machine and the
//! operating system's dynamic loader. [`LibraryLinker`] is the `libloading`
//! implementation; tests substitute a counting double.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libloading::Library;

use crate::engine::Engine;

use super::ffi::NativeEngine;

/// What to hand to the dynamic loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// A base name resolved through the search path (`stable-diffusion`
    /// becomes `libstable-diffusion.so`, `stable-diffusion.dll`, ...).
    SearchPath(String),
    /// An absolute path to a module file.
    File(PathBuf),
}

impl std::fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkTarget::SearchPath(name) => write!(f, "{} (search path)", name),
            LinkTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Why a link attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The module is not on the search path or the file does not exist.
    NotFound(String),
    /// The module was found but the loader refused it, or a required symbol
    /// is missing.
    Rejected(String),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::NotFound(msg) => write!(f, "not found: {}", msg),
            LinkError::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

/// Opens engine modules.
pub trait Linker: Send + Sync {
    /// Loads the module and resolves the engine entry points.
    fn open(&self, target: &LinkTarget) -> Result<Arc<dyn Engine>, LinkError>;

    /// Adds `dir` to the search path used by later [`LinkTarget::SearchPath`]
    /// opens and by the module's own dependencies.
    ///
    /// [`LibraryLinker`] also rewrites the process environment's search path
    /// variable, which is not synchronized with concurrent environment reads.
    fn add_search_dir(&self, dir: &Path);
}

impl<L: Linker + ?Sized> Linker for Arc<L> {
    fn open(&self, target: &LinkTarget) -> Result<Arc<dyn Engine>, LinkError> {
        (**self).open(target)
    }

    fn add_search_dir(&self, dir: &Path) {
        (**self).add_search_dir(dir)
    }
}

/// Environment variable the platform's loader consults for extra directories.
pub fn search_path_var() -> &'static str {
    if cfg!(windows) {
        "PATH"
    } else if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// Returns `dir` prepended to the current value of the search path variable.
fn prepended_search_path(dir: &Path) -> Option<OsString> {
    let existing = std::env::var_os(search_path_var());
    let mut dirs = vec![dir.to_path_buf()];
    if let Some(existing) = existing.as_ref() {
        dirs.extend(std::env::split_paths(existing).filter(|p| p != dir));
    }
    std::env::join_paths(dirs).ok()
}

/// Classifies a failed open of `file_name` through the search path.
///
/// Only a message about `file_name` itself counts as absence. A message naming
/// some other module is about a missing dependency of a module that was found,
/// and on macOS "library not loaded" means the same.
pub(crate) fn classify_load_error(message: &str, file_name: &str) -> LinkError {
    let lower = message.to_lowercase();
    let absent = [
        "no such file",
        "not found",
        "could not be found",
        "cannot find",
        "os error 126",
    ]
    .iter()
    .any(|needle| lower.contains(needle));
    let names_requested = lower.contains(&file_name.to_lowercase());
    let names_other_module = [".so", ".dylib", ".dll"]
        .iter()
        .any(|ext| lower.contains(ext));
    let missing_dependency =
        lower.contains("library not loaded") || (!names_requested && names_other_module);

    if absent && !missing_dependency {
        LinkError::NotFound(message.to_string())
    } else {
        LinkError::Rejected(message.to_string())
    }
}

/// `libloading`-backed linker.
#[derive(Debug, Default)]
pub struct LibraryLinker {
    extra_dirs: Mutex<Vec<PathBuf>>,
}

impl LibraryLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a module file known to exist. Any failure is a refusal.
    fn open_file(path: &Path) -> Result<Library, LinkError> {
        // SAFETY: loading runs the module's initializers; the module is the
        // engine build this bridge is shipped with.
        unsafe { Library::new(path) }
            .map_err(|e| LinkError::Rejected(format!("{}: {}", path.display(), e)))
    }

    /// Looks for `file_name` in the registered directories, then in the
    /// directories of the search path variable.
    fn find_candidate(&self, file_name: &OsStr) -> Option<PathBuf> {
        let mut dirs = self
            .extra_dirs
            .lock()
            .map(|dirs| dirs.clone())
            .unwrap_or_default();
        if let Some(var) = std::env::var_os(search_path_var()) {
            dirs.extend(std::env::split_paths(&var));
        }
        dirs.into_iter()
            .map(|dir| dir.join(file_name))
            .find(|candidate| candidate.is_file())
    }

    fn open_by_name(&self, name: &str) -> Result<Library, LinkError> {
        let file_name = libloading::library_filename(name);
        if let Some(candidate) = self.find_candidate(&file_name) {
            return Self::open_file(&candidate);
        }

        // SAFETY: as in `open_file`.
        unsafe { Library::new(&file_name) }
            .map_err(|e| classify_load_error(&e.to_string(), &file_name.to_string_lossy()))
    }
}

impl Linker for LibraryLinker {
    fn open(&self, target: &LinkTarget) -> Result<Arc<dyn Engine>, LinkError> {
        let library = match target {
            LinkTarget::SearchPath(name) => self.open_by_name(name)?,
            LinkTarget::File(path) => {
                if !path.is_file() {
                    return Err(LinkError::NotFound(format!("{} does not exist", path.display())));
                }
                Self::open_file(path)?
            }
        };
        let engine = NativeEngine::from_library(library)
            .map_err(|e| LinkError::Rejected(format!("{}: {}", target, e)))?;
        Ok(Arc::new(engine))
    }

    fn add_search_dir(&self, dir: &Path) {
        if let Ok(mut dirs) = self.extra_dirs.lock() {
            if !dirs.iter().any(|d| d == dir) {
                dirs.insert(0, dir.to_path_buf());
            }
        }
        if let Some(value) = prepended_search_path(dir) {
            tracing::debug!(var = search_path_var(), dir = %dir.display(), "extending library search path");
            // Called once per loader, during its first load and under its
            // state lock, before any engine exists. Other threads
            // reading the environment at that moment (getenv in C code) are
            // not synchronized with this write, so callers should load the
            // module before spawning threads that touch the environment.
            std::env::set_var(search_path_var(), value);
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::engine::mock::MockEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted linker: the search path never has the module unless told so,
    /// and any existing file opens successfully.
    #[derive(Default)]
    pub(crate) struct MockLinker {
        pub(crate) on_search_path: bool,
        pub(crate) reject_search_path: bool,
        pub(crate) reject_files: bool,
        /// Widens the race window for concurrency tests.
        pub(crate) delay: Duration,
        pub(crate) opens: AtomicUsize,
        pub(crate) file_opens: AtomicUsize,
        pub(crate) search_dirs: Mutex<Vec<PathBuf>>,
    }

    impl MockLinker {
        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        pub(crate) fn file_opens(&self) -> usize {
            self.file_opens.load(Ordering::SeqCst)
        }

        pub(crate) fn search_dirs(&self) -> Vec<PathBuf> {
            self.search_dirs.lock().unwrap().clone()
        }
    }

    impl Linker for MockLinker {
        fn open(&self, target: &LinkTarget) -> Result<Arc<dyn Engine>, LinkError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            match target {
                LinkTarget::SearchPath(name) if self.reject_search_path => {
                    Err(LinkError::Rejected(format!("{}: wrong ELF class", name)))
                }
                LinkTarget::SearchPath(name) if !self.on_search_path => Err(LinkError::NotFound(
                    format!("{}: cannot open shared object file: No such file or directory", name),
                )),
                LinkTarget::SearchPath(_) => Ok(Arc::new(MockEngine::new())),
                LinkTarget::File(path) => {
                    self.file_opens.fetch_add(1, Ordering::SeqCst);
                    if !path.is_file() {
                        Err(LinkError::NotFound(path.display().to_string()))
                    } else if self.reject_files {
                        Err(LinkError::Rejected(format!("{}: invalid ELF header", path.display())))
                    } else {
                        Ok(Arc::new(MockEngine::new()))
                    }
                }
            }
        }

        fn add_search_dir(&self, dir: &Path) {
            self.search_dirs.lock().unwrap().push(dir.to_path_buf());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &str = "libstable-diffusion.so";

    #[test]
    fn absent_modules_are_classified_as_not_found() {
        let linux = "libstable-diffusion.so: cannot open shared object file: No such file or directory";
        assert!(matches!(classify_load_error(linux, MODULE), LinkError::NotFound(_)));

        let mac = "dlopen(libstable-diffusion.dylib, 0x0005): image not found";
        assert!(matches!(
            classify_load_error(mac, "libstable-diffusion.dylib"),
            LinkError::NotFound(_)
        ));

        let windows = "LoadLibraryExW failed: The specified module could not be found. (os error 126)";
        assert!(matches!(
            classify_load_error(windows, "stable-diffusion.dll"),
            LinkError::NotFound(_)
        ));
    }

    #[test]
    fn other_loader_failures_are_rejections() {
        let bad_elf = "libstable-diffusion.so: invalid ELF header";
        assert!(matches!(classify_load_error(bad_elf, MODULE), LinkError::Rejected(_)));

        let wrong_arch = "libstable-diffusion.so: wrong ELF class: ELFCLASS32";
        assert!(matches!(classify_load_error(wrong_arch, MODULE), LinkError::Rejected(_)));
    }

    #[test]
    fn missing_dependency_of_present_module_is_rejected() {
        let linux = "libmissingdep.so: cannot open shared object file: No such file or directory";
        assert!(matches!(classify_load_error(linux, MODULE), LinkError::Rejected(_)));

        let mac = "dlopen(libstable-diffusion.dylib, 0x0005): Library not loaded: @rpath/libmissingdep.dylib\n  \
                   Referenced from: libstable-diffusion.dylib\n  Reason: tried: 'libmissingdep.dylib' (no such file)";
        assert!(matches!(
            classify_load_error(mac, "libstable-diffusion.dylib"),
            LinkError::Rejected(_)
        ));
    }

    #[test]
    fn present_module_that_fails_to_load_is_not_treated_as_absent() {
        let linker = LibraryLinker::new();
        let dir = tempfile::tempdir().unwrap();
        let name = "sd-bridge-unloadable";
        std::fs::write(
            dir.path().join(libloading::library_filename(name)),
            b"not a loadable module",
        )
        .unwrap();
        linker.extra_dirs.lock().unwrap().push(dir.path().to_path_buf());

        assert!(matches!(
            linker.open(&LinkTarget::SearchPath(name.to_string())),
            Err(LinkError::Rejected(_))
        ));
    }

    #[test]
    fn module_absent_everywhere_is_not_found() {
        let linker = LibraryLinker::new();
        let target = LinkTarget::SearchPath("sd-bridge-no-such-module-4f1c".to_string());
        assert!(matches!(linker.open(&target), Err(LinkError::NotFound(_))));
    }

    #[test]
    fn missing_file_target_is_not_found() {
        let linker = LibraryLinker::new();
        let dir = tempfile::tempdir().unwrap();
        let target = LinkTarget::File(dir.path().join("libstable-diffusion.so"));
        assert!(matches!(linker.open(&target), Err(LinkError::NotFound(_))));
    }

    #[test]
    fn garbage_file_is_rejected() {
        let linker = LibraryLinker::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(libloading::library_filename("garbage"));
        std::fs::write(&path, b"definitely not a shared object").unwrap();
        assert!(matches!(
            linker.open(&LinkTarget::File(path)),
            Err(LinkError::Rejected(_))
        ));
    }

    #[test]
    fn search_path_prepends_without_duplicates() {
        let dir = Path::new("/opt/sd-bridge/lib");
        let joined = prepended_search_path(dir).unwrap();
        let dirs: Vec<PathBuf> = std::env::split_paths(&joined).collect();
        assert_eq!(dirs[0], dir);
        assert_eq!(dirs.iter().filter(|d| d.as_path() == dir).count(), 1);
    }
}
