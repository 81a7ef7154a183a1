//! Bundled native module resources.
//!
//! A bundle is a read-only set of platform-specific engine libraries keyed by
//! their relative resource path. The fixed resource table decides which entry
//! (if any) belongs to the running platform.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, SdError};

use super::platform::{Arch, Os, PlatformDescriptor};

/// Resource path for every supported platform.
///
/// Combinations missing from this table (32-bit x86 anywhere, ARM anywhere,
/// unknown operating systems) are unsupported and never extracted.
pub const MODULE_RESOURCES: &[(Os, Arch, &str)] = &[
    (Os::Linux, Arch::X86_64, "lib/linux/x86_64/libstable-diffusion.so"),
    (Os::MacOs, Arch::X86_64, "lib/osx/x86_64/libstable-diffusion.dylib"),
    (Os::Windows, Arch::X86_64, "lib/windows/x86_64/stable-diffusion.dll"),
];

/// Selects the bundled resource path for a platform.
pub fn select_resource(platform: PlatformDescriptor) -> Result<&'static str> {
    let resource = MODULE_RESOURCES
        .iter()
        .find(|(os, arch, _)| *os == platform.os && *arch == platform.arch)
        .map(|(_, _, path)| *path)
        .ok_or_else(|| {
            SdError::unsupported_platform(format!(
                "operating system \"{}\" and architecture \"{}\" are not supported",
                platform.os, platform.arch
            ))
        })?;
    tracing::debug!(%platform, resource, "selected native module resource");
    Ok(resource)
}

/// Source of bundled module bytes.
pub trait ModuleBundle: Send + Sync {
    /// Reads the full contents of the resource at `resource` (a relative,
    /// forward-slash separated path).
    fn read(&self, resource: &str) -> io::Result<Vec<u8>>;
}

/// Bundle stored as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryBundle {
    root: PathBuf,
}

impl DirectoryBundle {
    /// Creates a bundle rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the bundle root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModuleBundle for DirectoryBundle {
    fn read(&self, resource: &str) -> io::Result<Vec<u8>> {
        let path = resource
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part));
        std::fs::read(&path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("bundled resource {} unreadable: {}", path.display(), e),
            )
        })
    }
}

/// Bundle compiled into the binary, e.g. with `include_bytes!`.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedBundle {
    entries: HashMap<&'static str, &'static [u8]>,
}

impl EmbeddedBundle {
    /// Creates an empty embedded bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource to the bundle.
    pub fn with_resource(mut self, resource: &'static str, bytes: &'static [u8]) -> Self {
        self.entries.insert(resource, bytes);
        self
    }
}

impl ModuleBundle for EmbeddedBundle {
    fn read(&self, resource: &str) -> io::Result<Vec<u8>> {
        self.entries
            .get(resource)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("resource {} is not embedded in this build", resource),
                )
            })
    }
}
