//! Native engine module discovery, extraction and loading.
//!
//! - [`platform`]: OS and architecture resolution
//! - [`bundle`]: bundled module resources and the per-platform table
//! - [`extract`]: ephemeral extraction directories and their cleanup
//! - [`linker`]: the dynamic loader seam
//! - [`ffi`]: the engine's C ABI
//! - [`loader`]: the once-per-process load state machine

use std::sync::{Arc, OnceLock};

use crate::config::{BridgeConfig, LoaderConfig};
use crate::engine::Engine;
use crate::error::Result;

pub mod bundle;
pub mod extract;
pub mod ffi;
pub mod linker;
pub mod loader;
pub mod platform;

// Re-export commonly used types
pub use bundle::{select_resource, DirectoryBundle, EmbeddedBundle, ModuleBundle, MODULE_RESOURCES};
pub use extract::{CleanupPolicy, ExtractedModule, EXTRACT_DIR_PREFIX};
pub use linker::{LibraryLinker, LinkError, LinkTarget, Linker};
pub use loader::{LoadState, LoadedModule, ModuleOrigin, NativeModuleLoader};
pub use platform::{Arch, Os, PlatformDescriptor};

static GLOBAL_LOADER: OnceLock<NativeModuleLoader> = OnceLock::new();

/// Installs the process-wide loader configuration.
///
/// Returns false if the process-wide loader already exists, in which case
/// `config` is ignored.
pub fn configure_global(config: LoaderConfig) -> bool {
    let mut installed = false;
    GLOBAL_LOADER.get_or_init(|| {
        installed = true;
        NativeModuleLoader::new(config)
    });
    installed
}

/// Returns the process-wide loader, configured from the environment unless
/// [`configure_global`] ran first.
pub fn global_loader() -> &'static NativeModuleLoader {
    GLOBAL_LOADER.get_or_init(|| NativeModuleLoader::new(BridgeConfig::from_env().loader))
}

/// Loads the engine module into this process, once.
///
/// An extraction rewrites the library search path variable, so call this
/// before starting threads that read the environment.
pub fn ensure_loaded() -> Result<Arc<dyn Engine>> {
    global_loader().ensure_loaded()
}
