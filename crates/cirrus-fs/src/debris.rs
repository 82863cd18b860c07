//! Local debris folder
//!
//! Deletions never unlink: the entity is renamed into
//! `<root>/.debris/<YYYY-MM-DD>/`, where the user can recover it. A lock
//! file keeps the debris directory itself alive and marks it as owned by the
//! sync.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::FsError;

/// Name of the debris directory directly under the sync root.
pub const DEBRIS_DIR_NAME: &str = ".debris";

/// Lock file kept open inside the debris directory for the sync's lifetime.
pub const DEBRIS_LOCK_NAME: &str = ".lock";

/// Handle to one sync's local debris folder.
#[derive(Debug)]
pub struct LocalDebris {
    root: PathBuf,
    // Permanent lock; released when the sync shuts down.
    _lock: std::fs::File,
}

impl LocalDebris {
    /// Creates (or reopens) the debris folder under `sync_root` and takes the
    /// lock file.
    pub fn open(sync_root: &Path) -> Result<Self, FsError> {
        let root = sync_root.join(DEBRIS_DIR_NAME);
        std::fs::create_dir_all(&root).map_err(|e| FsError::io(&root, e))?;

        let lock_path = root.join(DEBRIS_LOCK_NAME);
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| FsError::io(&lock_path, e))?;

        Ok(Self { root, _lock: lock })
    }

    /// Path of the debris directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Moves `path` into today's debris subfolder, renaming rather than
    /// deleting. Name collisions get a numeric suffix.
    pub fn store(&self, path: &Path) -> Result<PathBuf, FsError> {
        let day_dir = self.root.join(Utc::now().format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&day_dir).map_err(|e| FsError::io(&day_dir, e))?;

        let leaf = path
            .file_name()
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))?;

        let mut target = day_dir.join(leaf);
        let mut counter = 1u32;
        while target.exists() {
            let mut name = leaf.to_os_string();
            name.push(format!(" ({counter})"));
            target = day_dir.join(name);
            counter += 1;
        }

        std::fs::rename(path, &target).map_err(|e| FsError::io(path, e))?;
        debug!(from = %path.display(), to = %target.display(), "moved to local debris");
        Ok(target)
    }
}
