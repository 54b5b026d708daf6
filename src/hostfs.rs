//! Host filesystem capability.
//!
//! The reconciler checks host volume directories through this trait rather
//! than touching the filesystem directly, so tests can script which paths
//! exist.

use std::path::Path;

/// Read-only queries against the host filesystem.
pub trait HostFs: Send + Sync {
    /// Returns true if `path` exists and is a directory.
    fn is_dir(&self, path: &Path) -> bool;
}

/// [`HostFs`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl HostFs for LocalFs {
    fn is_dir(&self, path: &Path) -> bool {
        // Follows symlinks, matching what the daemon sees when binding.
        std::fs::metadata(path).is_ok_and(|m| m.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_fs_is_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        assert!(LocalFs.is_dir(dir.path()));
        assert!(!LocalFs.is_dir(&file));
        assert!(!LocalFs.is_dir(&dir.path().join("missing")));
    }
}
