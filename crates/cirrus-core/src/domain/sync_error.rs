//! Sync-level error codes
//!
//! `SyncError` is the closed set of reasons a sync can be stopped or faulted.
//! It is persisted with the config so a disabled sync still shows why it was
//! disabled after a restart.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a sync is disabled, failed, or degraded.
///
/// `NoSyncError` is the explicit "all good" value so the config serialization
/// never has to distinguish absent from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncError {
    #[default]
    #[error("no error")]
    NoSyncError,

    #[error("local sync root is unavailable")]
    LocalPathUnavailable,

    #[error("remote root node not found")]
    RemoteNodeNotFound,

    #[error("insufficient permissions on the remote root")]
    InsufficientPermissions,

    #[error("local filesystem type is not supported")]
    FilesystemTypeUnsupported,

    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("backup was modified remotely")]
    BackupModified,

    #[error("backup source is not below the drive path")]
    BackupSourceNotBelowDrive,

    #[error("state cache I/O failure")]
    StateCacheIOFailure,

    #[error("sync is stalled and needs user intervention")]
    Stalled,

    #[error("too many changes pending")]
    TooManyChanges,
}

impl SyncError {
    /// True for every value except `NoSyncError`.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, SyncError::NoSyncError)
    }
}
