//! Cirrus filesystem abstraction
//!
//! Everything the sync core needs from the local filesystem, and nothing
//! more:
//! - stat/read-dir snapshots with stable ids ([`snapshot`])
//! - filesystem-family detection and the per-family forbidden-byte tables
//!   ([`fskind`])
//! - `%xx` escaping of cloud names into locally valid names ([`escape`])
//! - directory change notification with a no-op fallback ([`notifier`])
//! - the local debris folder used instead of deletion ([`debris`])
//!
//! Paths handed to this crate are absolute. Names cross the cloud boundary
//! NFC-normalized; [`escape::normalize_nfc`] is the single place that does it.

pub mod debris;
pub mod escape;
pub mod fskind;
pub mod notifier;
pub mod snapshot;

use std::path::Path;

use thiserror::Error;

pub use debris::LocalDebris;
pub use escape::{escape_name, normalize_nfc, unescape_name};
pub use fskind::FsKind;
pub use notifier::{DirNotifier, NoopNotifier, Notification, NotifyBackend, NotifyQueue};
pub use snapshot::{read_dir_entries, stat, FsEntry, FsStat};

/// Errors from local filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("path does not exist: {0}")]
    NotFound(std::path::PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(std::path::PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("change notification unavailable: {0}")]
    NotifyUnavailable(String),
}

impl FsError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Renames `src` to `dst` within one volume.
///
/// This is the primitive behind local moves and debris staging; cross-volume
/// moves are not attempted (the engine falls back to copy+delete through the
/// cloud for cross-sync moves).
pub fn rename(src: &Path, dst: &Path) -> Result<(), FsError> {
    std::fs::rename(src, dst).map_err(|e| FsError::io(src, e))
}
