//! Cirrus persistence
//!
//! Two stores live here:
//! - the encrypted, slot-rotated sync-config database
//!   ([`SyncConfigIoContext`] + [`SyncConfigStore`]), one per drive, so
//!   removable-drive backups carry their own configs; and
//! - the per-sync [`StateCache`] of serialized mirror nodes, a SQLite table
//!   with insert/delete queues drained transactionally at the end of a tick.

pub mod config_store;
pub mod io_context;
pub mod state_cache;

use std::path::PathBuf;

use thiserror::Error;

pub use config_store::SyncConfigStore;
pub use io_context::{SyncConfigIoContext, MAX_SLOTS, NAME_PREFIX};
pub use state_cache::StateCache;

/// Errors from the config database and the state cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No database exists for the drive at all.
    #[error("no config database at {0}")]
    NoDatabase(PathBuf),

    /// Every slot on disk failed verification or decryption. The caller
    /// decides whether to clear the database.
    #[error("no config slot could be read at {0}")]
    ReadFailure(PathBuf),

    #[error("config payload is malformed")]
    Malformed,

    #[error("authentication or decryption failed")]
    Crypto,

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state cache failure: {0}")]
    StateCache(#[from] sqlx::Error),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
