//! Once-per-process loading of the engine module.
//!
//! [`NativeModuleLoader::ensure_loaded`] walks the load sequence:
//!
//! 1. Fast path: a module already published in the `OnceLock` is returned
//!    without locking or I/O.
//! 2. Under the state mutex, try the system search path.
//! 3. On a miss, pick the bundled resource for this platform. Unsupported
//!    platforms fail here and nothing is extracted. A module that was found
//!    but refused is fatal and is not masked by extraction.
//! 4. On platforms that lock loaded modules, purge stale extraction
//!    directories. Then create a fresh one.
//! 5. Copy the resource into it.
//! 6. Add the directory to the library search path.
//! 7. Load the extracted copy.
//! 8. Schedule the directory for deletion at exit, or leave it for the next
//!    start on platforms that lock loaded modules.
//!
//! The outcome is recorded once; every later caller observes the same
//! success or the same failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::{LoadStrategy, LoaderConfig};
use crate::engine::Engine;
use crate::error::{ErrorCode, Result, SdError};

use super::bundle::{select_resource, DirectoryBundle, ModuleBundle};
use super::extract::{
    create_extraction_dir, extract_resource, purge_stale_dirs, schedule_cleanup, CleanupPolicy,
    ExtractedModule, PurgeReport,
};
use super::linker::{LibraryLinker, LinkError, LinkTarget, Linker};
use super::platform::PlatformDescriptor;

/// Lifecycle of the process-wide module load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    /// Terminal failure, replayed to every later caller.
    Failed { code: ErrorCode, message: String },
}

/// Where the loaded module came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOrigin {
    /// Found on the system search path.
    SearchPath,
    /// Extracted from the bundle.
    Extracted(ExtractedModule),
}

/// A successfully loaded engine module.
pub struct LoadedModule {
    pub engine: Arc<dyn Engine>,
    pub origin: ModuleOrigin,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Loads the engine module exactly once.
pub struct NativeModuleLoader {
    config: LoaderConfig,
    bundle: Box<dyn ModuleBundle>,
    linker: Box<dyn Linker>,
    platform: Option<PlatformDescriptor>,
    loaded: OnceLock<LoadedModule>,
    state: Mutex<LoadState>,
    extractions: AtomicUsize,
}

impl NativeModuleLoader {
    /// Creates a loader reading the bundle from the configured directory and
    /// linking through the system dynamic loader.
    pub fn new(config: LoaderConfig) -> Self {
        let bundle = DirectoryBundle::new(config.effective_bundle_dir());
        Self::with_parts(config, Box::new(bundle), Box::new(LibraryLinker::new()))
    }

    /// Creates a loader with explicit bundle and linker.
    pub fn with_parts(
        config: LoaderConfig,
        bundle: Box<dyn ModuleBundle>,
        linker: Box<dyn Linker>,
    ) -> Self {
        Self {
            config,
            bundle,
            linker,
            platform: None,
            loaded: OnceLock::new(),
            state: Mutex::new(LoadState::Unloaded),
            extractions: AtomicUsize::new(0),
        }
    }

    /// Overrides the detected platform.
    pub fn with_platform(mut self, platform: PlatformDescriptor) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Returns a snapshot of the load state.
    pub fn state(&self) -> LoadState {
        if self.loaded.get().is_some() {
            return LoadState::Loaded;
        }
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Returns the loaded module, if loading has succeeded.
    pub fn loaded_module(&self) -> Option<&LoadedModule> {
        self.loaded.get()
    }

    /// Number of extractions performed by this loader (0 or 1).
    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }

    /// Loads the module if needed and returns its engine.
    ///
    /// Safe to call from any number of threads; concurrent first callers
    /// serialize on one lock and exactly one of them performs the load.
    pub fn ensure_loaded(&self) -> Result<Arc<dyn Engine>> {
        if let Some(module) = self.loaded.get() {
            return Ok(module.engine.clone());
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(module) = self.loaded.get() {
            return Ok(module.engine.clone());
        }
        if let LoadState::Failed { code, message } = &*state {
            return Err(SdError::new(*code, message.clone()));
        }

        *state = LoadState::Loading;
        tracing::debug!(
            library = %self.config.library_name,
            strategy = %self.config.strategy,
            "loading native module"
        );

        match self.load_module() {
            Ok(module) => {
                let engine = module.engine.clone();
                tracing::info!(origin = ?module.origin, "native module loaded");
                // Only reachable once: the lock is held and `loaded` was empty.
                let _ = self.loaded.set(module);
                *state = LoadState::Loaded;
                Ok(engine)
            }
            Err(e) => {
                tracing::debug!(error = %e, "native module load failed");
                *state = LoadState::Failed {
                    code: e.code,
                    message: e.message.clone(),
                };
                Err(e)
            }
        }
    }

    /// Runs steps 2 to 8 of the load sequence. Caller holds the state lock.
    fn load_module(&self) -> Result<LoadedModule> {
        let name = &self.config.library_name;

        if self.config.strategy == LoadStrategy::Shared {
            match self.linker.open(&LinkTarget::SearchPath(name.clone())) {
                Ok(engine) => {
                    return Ok(LoadedModule {
                        engine,
                        origin: ModuleOrigin::SearchPath,
                    })
                }
                Err(LinkError::NotFound(reason)) => {
                    tracing::debug!(%reason, "module not on search path, using bundled copy");
                }
                Err(LinkError::Rejected(reason)) => {
                    return Err(SdError::load_failed(format!(
                        "{} was found on the search path but could not be loaded: {}",
                        name, reason
                    )));
                }
            }
        }

        let platform = match self.platform {
            Some(platform) => platform,
            None => PlatformDescriptor::current()?,
        };
        let resource = select_resource(platform)?;

        let temp_root = self.config.effective_temp_root();
        // Only a locking platform can tell a running instance's directory
        // from a leftover; elsewhere leftovers are removed by the exit hook.
        if platform.os.locks_loaded_modules() {
            let report = purge_stale_dirs(&temp_root, self.config.stale_after());
            if report != PurgeReport::default() {
                tracing::debug!(?report, "purged stale module directories");
            }
        }

        let dir = create_extraction_dir(&temp_root)?;
        let extracted = match extract_resource(self.bundle.as_ref(), resource, &dir) {
            Ok(extracted) => extracted,
            Err(e) => {
                remove_quietly(&dir);
                return Err(e);
            }
        };
        self.extractions.fetch_add(1, Ordering::SeqCst);

        self.linker.add_search_dir(extracted.module_dir());

        let engine = match self.linker.open(&LinkTarget::File(extracted.destination.clone())) {
            Ok(engine) => engine,
            Err(e) => {
                remove_quietly(&dir);
                return Err(SdError::load_failed(format!(
                    "extracted module {} could not be loaded: {}",
                    extracted.destination.display(),
                    e
                )));
            }
        };

        let policy = if platform.os.locks_loaded_modules() {
            CleanupPolicy::PurgeOnNextStart
        } else {
            CleanupPolicy::DeleteOnExit
        };
        schedule_cleanup(&dir, policy);

        Ok(LoadedModule {
            engine,
            origin: ModuleOrigin::Extracted(extracted),
        })
    }
}

fn remove_quietly(dir: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to remove extraction directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::bundle::EmbeddedBundle;
    use crate::native::extract::{pending_cleanup, EXTRACT_DIR_PREFIX};
    use crate::native::linker::mock::MockLinker;
    use crate::native::platform::{Arch, Os};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const LINUX: PlatformDescriptor = PlatformDescriptor {
        os: Os::Linux,
        arch: Arch::X86_64,
    };
    const LINUX_RESOURCE: &str = "lib/linux/x86_64/libstable-diffusion.so";
    const WINDOWS_RESOURCE: &str = "lib/windows/x86_64/stable-diffusion.dll";

    struct Fixture {
        temp: TempDir,
        linker: Arc<MockLinker>,
        loader: NativeModuleLoader,
    }

    impl Fixture {
        fn linker(&self) -> &MockLinker {
            &self.linker
        }
    }

    fn config(temp_root: &Path, strategy: LoadStrategy) -> LoaderConfig {
        LoaderConfig {
            temp_root: Some(temp_root.to_path_buf()),
            strategy,
            stale_after_secs: 0,
            ..LoaderConfig::default()
        }
    }

    fn bundle() -> EmbeddedBundle {
        EmbeddedBundle::new()
            .with_resource(LINUX_RESOURCE, b"\x7fELF fake engine")
            .with_resource(WINDOWS_RESOURCE, b"MZ fake engine")
    }

    fn fixture(linker: MockLinker, strategy: LoadStrategy, platform: PlatformDescriptor) -> Fixture {
        let temp = tempdir().unwrap();
        let linker = Arc::new(linker);
        let loader = NativeModuleLoader::with_parts(
            config(temp.path(), strategy),
            Box::new(bundle()),
            Box::new(linker.clone()),
        )
        .with_platform(platform);
        Fixture {
            temp,
            linker,
            loader,
        }
    }

    fn extraction_dirs(root: &Path) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(root)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(EXTRACT_DIR_PREFIX))
            })
            .collect()
    }

    #[test]
    fn search_path_hit_skips_extraction() {
        let linker = MockLinker {
            on_search_path: true,
            ..Default::default()
        };
        let f = fixture(linker, LoadStrategy::Shared, LINUX);

        f.loader.ensure_loaded().unwrap();

        assert_eq!(f.loader.state(), LoadState::Loaded);
        assert_eq!(f.loader.extractions(), 0);
        assert_eq!(f.loader.loaded_module().unwrap().origin, ModuleOrigin::SearchPath);
        assert!(extraction_dirs(f.temp.path()).is_empty());
    }

    #[test]
    fn search_path_miss_extracts_bundled_copy() {
        let f = fixture(MockLinker::default(), LoadStrategy::Shared, LINUX);

        f.loader.ensure_loaded().unwrap();

        let module = f.loader.loaded_module().unwrap();
        let ModuleOrigin::Extracted(extracted) = &module.origin else {
            panic!("expected an extracted module");
        };
        assert_eq!(extracted.source_resource, LINUX_RESOURCE);
        assert!(extracted.destination.ends_with(LINUX_RESOURCE));
        assert_eq!(std::fs::read(&extracted.destination).unwrap(), b"\x7fELF fake engine");
        assert_eq!(f.linker().search_dirs(), vec![extracted.module_dir().to_path_buf()]);
        assert!(pending_cleanup().contains(&extracted.temporary_root));
    }

    #[test]
    fn repeated_calls_load_once() {
        let f = fixture(MockLinker::default(), LoadStrategy::Shared, LINUX);
        let first = f.loader.ensure_loaded().unwrap();
        let second = f.loader.ensure_loaded().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.linker().opens(), 2);
        assert_eq!(f.loader.extractions(), 1);
    }

    #[test]
    fn concurrent_first_callers_share_one_load() {
        let linker = MockLinker {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let f = fixture(linker, LoadStrategy::Shared, LINUX);

        let engines: Vec<Arc<dyn Engine>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| f.loader.ensure_loaded().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(engines.len(), 8);
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(f.loader.extractions(), 1);
        assert_eq!(f.linker().file_opens(), 1);
        assert_eq!(extraction_dirs(f.temp.path()).len(), 1);
    }

    #[test]
    fn unsupported_platform_never_extracts() {
        let platform = PlatformDescriptor {
            os: Os::Linux,
            arch: Arch::X86_32,
        };
        let f = fixture(MockLinker::default(), LoadStrategy::Shared, platform);

        let err = f.loader.ensure_loaded().unwrap_err();

        assert_eq!(err.code, ErrorCode::UnsupportedPlatform);
        assert!(err.is_fatal());
        assert_eq!(f.loader.extractions(), 0);
        assert!(extraction_dirs(f.temp.path()).is_empty());
    }

    #[test]
    fn refused_search_path_module_is_not_masked() {
        let linker = MockLinker {
            reject_search_path: true,
            ..Default::default()
        };
        let f = fixture(linker, LoadStrategy::Shared, LINUX);

        let err = f.loader.ensure_loaded().unwrap_err();

        assert_eq!(err.code, ErrorCode::LoadFailed);
        assert_eq!(f.loader.extractions(), 0);
        assert_eq!(f.linker().file_opens(), 0);
    }

    #[test]
    fn failure_is_replayed_to_later_callers() {
        let linker = MockLinker {
            reject_files: true,
            ..Default::default()
        };
        let f = fixture(linker, LoadStrategy::Shared, LINUX);

        let first = f.loader.ensure_loaded().unwrap_err();
        let opens = f.linker().opens();
        let second = f.loader.ensure_loaded().unwrap_err();

        assert_eq!(first.code, ErrorCode::LoadFailed);
        assert_eq!(second.code, first.code);
        assert_eq!(second.message, first.message);
        assert_eq!(f.linker().opens(), opens);
        assert!(matches!(f.loader.state(), LoadState::Failed { .. }));
        assert!(extraction_dirs(f.temp.path()).is_empty());
    }

    #[test]
    fn missing_bundle_resource_is_extraction_error() {
        let temp = tempdir().unwrap();
        let loader = NativeModuleLoader::with_parts(
            config(temp.path(), LoadStrategy::Shared),
            Box::new(EmbeddedBundle::new()),
            Box::new(MockLinker::default()),
        )
        .with_platform(LINUX);

        let err = loader.ensure_loaded().unwrap_err();

        assert_eq!(err.code, ErrorCode::ExtractionIo);
        assert!(extraction_dirs(temp.path()).is_empty());
    }

    #[test]
    fn local_strategy_skips_search_path() {
        let linker = MockLinker {
            on_search_path: true,
            ..Default::default()
        };
        let f = fixture(linker, LoadStrategy::Local, LINUX);

        f.loader.ensure_loaded().unwrap();

        assert_eq!(f.linker().opens(), 1);
        assert_eq!(f.linker().file_opens(), 1);
        assert!(matches!(
            f.loader.loaded_module().unwrap().origin,
            ModuleOrigin::Extracted(_)
        ));
    }

    const WINDOWS: PlatformDescriptor = PlatformDescriptor {
        os: Os::Windows,
        arch: Arch::X86_64,
    };

    #[test]
    fn leftovers_are_purged_before_extraction() {
        let f = fixture(MockLinker::default(), LoadStrategy::Shared, WINDOWS);
        let leftover = f.temp.path().join(format!("{}-old", EXTRACT_DIR_PREFIX));
        std::fs::create_dir_all(leftover.join("lib")).unwrap();
        let unrelated = f.temp.path().join("keep-me");
        std::fs::create_dir_all(&unrelated).unwrap();

        f.loader.ensure_loaded().unwrap();

        assert!(!leftover.exists());
        assert!(unrelated.exists());
        assert_eq!(extraction_dirs(f.temp.path()).len(), 1);
    }

    #[test]
    fn running_instance_dirs_survive_where_modules_are_not_locked() {
        // stale_after_secs is 0, so age alone would make this directory a target.
        let f = fixture(MockLinker::default(), LoadStrategy::Shared, LINUX);
        let other = f.temp.path().join(format!("{}-running", EXTRACT_DIR_PREFIX));
        let other_module = other.join("lib").join("libstable-diffusion.so");
        std::fs::create_dir_all(other_module.parent().unwrap()).unwrap();
        std::fs::write(&other_module, b"\x7fELF loaded elsewhere").unwrap();

        f.loader.ensure_loaded().unwrap();

        assert!(other_module.is_file());
        assert_eq!(extraction_dirs(f.temp.path()).len(), 2);
    }

    #[test]
    fn locking_platforms_defer_cleanup_to_next_start() {
        let f = fixture(MockLinker::default(), LoadStrategy::Shared, WINDOWS);

        f.loader.ensure_loaded().unwrap();

        let ModuleOrigin::Extracted(extracted) = &f.loader.loaded_module().unwrap().origin else {
            panic!("expected an extracted module");
        };
        assert!(!pending_cleanup().contains(&extracted.temporary_root));
        assert!(extracted.temporary_root.exists());
    }
}
