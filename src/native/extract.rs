//! Extraction of bundled modules into ephemeral directories.
//!
//! Each process extracts into its own uniquely named directory under the temp
//! root. Where the platform allows, the directory is removed at exit. Where
//! loaded modules are locked, it is left behind and purged by the next start.

use std::io;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

use crate::error::{Result, SdError};

use super::bundle::ModuleBundle;

/// Name prefix shared by every extraction directory.
pub const EXTRACT_DIR_PREFIX: &str = "sd-bridge";

/// Directories waiting for deletion at process exit.
static PENDING_CLEANUP: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
static REGISTER_EXIT_HOOK: Once = Once::new();

extern "C" {
    fn atexit(callback: extern "C" fn()) -> c_int;
}

/// A module copied out of the bundle onto the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedModule {
    /// Relative resource path inside the bundle.
    pub source_resource: String,
    /// Absolute path of the extracted module file.
    pub destination: PathBuf,
    /// Ephemeral directory holding the extracted copy.
    pub temporary_root: PathBuf,
}

impl ExtractedModule {
    /// Directory containing the module file itself.
    pub fn module_dir(&self) -> &Path {
        self.destination.parent().unwrap_or(&self.temporary_root)
    }
}

/// What happens to the extraction directory when the process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Recursively delete the directory at exit.
    DeleteOnExit,
    /// Leave the directory; the next process purges it on start.
    PurgeOnNextStart,
}

/// Outcome of a stale-directory purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub in_use: usize,
    pub failed: usize,
}

/// Returns true if a deletion failed because another process holds the file.
fn is_in_use(err: &io::Error) -> bool {
    // 32 is ERROR_SHARING_VIOLATION on Windows.
    err.kind() == io::ErrorKind::PermissionDenied || err.raw_os_error() == Some(32)
}

/// Returns true if the directory entry was last modified before `stale_after` ago.
fn is_stale(path: &Path, stale_after: Duration) -> bool {
    if stale_after.is_zero() {
        return true;
    }
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(true, |age| age >= stale_after)
}

/// Deletes leftover extraction directories under `parent`.
///
/// Every failure is logged and suppressed: a directory still locked by another
/// running instance is expected and only logged at debug level. Directories
/// younger than `stale_after` are skipped so a concurrently starting process
/// keeps its fresh extraction.
pub fn purge_stale_dirs(parent: &Path, stale_after: Duration) -> PurgeReport {
    let mut report = PurgeReport::default();

    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %parent.display(), error = %e, "cannot scan temp root for stale modules");
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_candidate = entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
            && entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.starts_with(EXTRACT_DIR_PREFIX));
        if !is_candidate || !is_stale(&path, stale_after) {
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::debug!(dir = %path.display(), "purged stale module directory");
                report.removed += 1;
            }
            Err(e) if is_in_use(&e) => {
                tracing::debug!(
                    dir = %path.display(),
                    "stale module directory still in use, likely by another instance"
                );
                report.in_use += 1;
            }
            Err(e) => {
                tracing::warn!(dir = %path.display(), error = %e, "failed to purge stale module directory");
                report.failed += 1;
            }
        }
    }

    report
}

/// Creates a fresh, uniquely named extraction directory under `temp_root`.
pub fn create_extraction_dir(temp_root: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(temp_root).map_err(|e| {
        SdError::extraction_io(format!("cannot create temp root {}", temp_root.display()), e)
    })?;
    let dir = tempfile::Builder::new()
        .prefix(EXTRACT_DIR_PREFIX)
        .tempdir_in(temp_root)
        .map_err(|e| {
            SdError::extraction_io(
                format!("cannot create extraction directory in {}", temp_root.display()),
                e,
            )
        })?;
    // Deletion is scheduled explicitly according to the cleanup policy.
    Ok(dir.keep())
}

/// Copies `resource` from the bundle into `dir`, preserving its relative path.
///
/// The written file is read back and compared to the bundled bytes by SHA-256.
pub fn extract_resource(
    bundle: &dyn ModuleBundle,
    resource: &str,
    dir: &Path,
) -> Result<ExtractedModule> {
    let bytes = bundle
        .read(resource)
        .map_err(|e| SdError::extraction_io(format!("resource {} missing from bundle", resource), e))?;
    let expected = Sha256::digest(&bytes);

    let destination = resource
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .fold(dir.to_path_buf(), |acc, part| acc.join(part));

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            SdError::extraction_io(format!("cannot create {}", parent.display()), e)
        })?;
    }

    tracing::debug!(destination = %destination.display(), "copying native module");
    std::fs::write(&destination, &bytes).map_err(|e| {
        SdError::extraction_io(
            format!("error writing native library to {}", destination.display()),
            e,
        )
    })?;

    let written = std::fs::read(&destination).map_err(|e| {
        SdError::extraction_io(format!("cannot verify {}", destination.display()), e)
    })?;
    let actual = Sha256::digest(&written);
    if actual != expected {
        return Err(SdError::extraction_io(
            format!("checksum mismatch for {}", destination.display()),
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {}, got {}", hex::encode(expected), hex::encode(actual)),
            ),
        ));
    }

    tracing::debug!(
        destination = %destination.display(),
        sha256 = %hex::encode(expected),
        "extracted native module"
    );

    Ok(ExtractedModule {
        source_resource: resource.to_string(),
        destination,
        temporary_root: dir.to_path_buf(),
    })
}

/// Applies the cleanup policy to an extraction directory.
pub fn schedule_cleanup(dir: &Path, policy: CleanupPolicy) {
    match policy {
        CleanupPolicy::DeleteOnExit => {
            if let Ok(mut pending) = PENDING_CLEANUP.lock() {
                pending.push(dir.to_path_buf());
            }
            REGISTER_EXIT_HOOK.call_once(|| {
                // SAFETY: `delete_pending_dirs` is a plain extern "C" function
                // that never unwinds.
                let rc = unsafe { atexit(delete_pending_dirs) };
                if rc != 0 {
                    tracing::warn!("could not register exit cleanup; extracted modules will be purged on next start");
                }
            });
            tracing::debug!(dir = %dir.display(), "module directory scheduled for deletion at exit");
        }
        CleanupPolicy::PurgeOnNextStart => {
            tracing::debug!(dir = %dir.display(), "module directory left for purge on next start");
        }
    }
}

/// Exit hook: deletes every scheduled directory, ignoring failures.
extern "C" fn delete_pending_dirs() {
    let _ = std::panic::catch_unwind(|| {
        if let Ok(mut pending) = PENDING_CLEANUP.lock() {
            for dir in pending.drain(..) {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
    });
}

/// Returns the directories currently scheduled for deletion at exit.
pub fn pending_cleanup() -> Vec<PathBuf> {
    PENDING_CLEANUP
        .lock()
        .map(|pending| pending.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::native::bundle::EmbeddedBundle;
    use tempfile::tempdir;

    const RESOURCE: &str = "lib/linux/x86_64/libstable-diffusion.so";

    #[test]
    fn extraction_dir_has_prefix_and_is_unique() {
        let root = tempdir().unwrap();
        let a = create_extraction_dir(root.path()).unwrap();
        let b = create_extraction_dir(root.path()).unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir());
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(EXTRACT_DIR_PREFIX));
    }

    #[test]
    fn extract_preserves_relative_path() {
        let root = tempdir().unwrap();
        let dir = create_extraction_dir(root.path()).unwrap();
        let bundle = EmbeddedBundle::new().with_resource(RESOURCE, b"\x7fELF fake module");

        let module = extract_resource(&bundle, RESOURCE, &dir).unwrap();
        assert_eq!(
            module.destination,
            dir.join("lib").join("linux").join("x86_64").join("libstable-diffusion.so")
        );
        assert_eq!(std::fs::read(&module.destination).unwrap(), b"\x7fELF fake module");
        assert_eq!(module.temporary_root, dir);
        assert_eq!(module.module_dir(), dir.join("lib").join("linux").join("x86_64"));
    }

    #[test]
    fn missing_resource_is_extraction_error() {
        let root = tempdir().unwrap();
        let dir = create_extraction_dir(root.path()).unwrap();
        let err = extract_resource(&EmbeddedBundle::new(), RESOURCE, &dir).unwrap_err();
        assert_eq!(err.code, ErrorCode::ExtractionIo);
    }

    #[test]
    fn purge_removes_only_prefixed_dirs() {
        let root = tempdir().unwrap();
        let stale = root.path().join(format!("{}abc123", EXTRACT_DIR_PREFIX));
        std::fs::create_dir_all(stale.join("lib")).unwrap();
        std::fs::write(stale.join("lib").join("old.so"), b"old").unwrap();
        let unrelated = root.path().join("keep-me");
        std::fs::create_dir_all(&unrelated).unwrap();

        let report = purge_stale_dirs(root.path(), Duration::ZERO);
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn purge_skips_fresh_dirs() {
        let root = tempdir().unwrap();
        let fresh = create_extraction_dir(root.path()).unwrap();
        let report = purge_stale_dirs(root.path(), Duration::from_secs(3600));
        assert_eq!(report, PurgeReport::default());
        assert!(fresh.exists());
    }

    #[test]
    fn purge_of_missing_parent_is_tolerated() {
        let root = tempdir().unwrap();
        let report = purge_stale_dirs(&root.path().join("absent"), Duration::ZERO);
        assert_eq!(report, PurgeReport::default());
    }

    #[test]
    fn delete_on_exit_records_dir() {
        let root = tempdir().unwrap();
        let dir = create_extraction_dir(root.path()).unwrap();
        schedule_cleanup(&dir, CleanupPolicy::DeleteOnExit);
        assert!(pending_cleanup().contains(&dir));
    }

    #[test]
    fn purge_on_next_start_leaves_dir() {
        let root = tempdir().unwrap();
        let dir = create_extraction_dir(root.path()).unwrap();
        schedule_cleanup(&dir, CleanupPolicy::PurgeOnNextStart);
        assert!(!pending_cleanup().contains(&dir));
        assert!(dir.exists());
    }
}
