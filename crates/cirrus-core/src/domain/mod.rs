//! Domain entities and value types shared across the sync core.

pub mod cloud_node;
pub mod fingerprint;
pub mod mirror_row;
pub mod newtypes;
pub mod sync_config;
pub mod sync_error;
pub mod tree_state;

pub use cloud_node::{CloudNode, NodeKind};
pub use fingerprint::FileFingerprint;
pub use mirror_row::MirrorRow;
pub use newtypes::{BackupId, Fsid, NodeHandle, TransferId, VolumeFingerprint};
pub use sync_config::{BackupState, SyncConfig, SyncDirection, SyncWarning, TieBreak};
pub use sync_error::SyncError;
pub use tree_state::TreeState;
