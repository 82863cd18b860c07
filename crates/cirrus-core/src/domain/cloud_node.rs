//! Cloud node snapshot
//!
//! The engine never owns cloud state; it keeps read-mostly snapshots of the
//! nodes below each sync's remote root, refreshed through the `CloudClient`
//! port. All writes go back through the port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fingerprint::FileFingerprint;
use super::newtypes::NodeHandle;

/// Kind of a synchronized entity, shared by cloud nodes, mirror nodes and
/// filesystem snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Folder,
}

impl NodeKind {
    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self, NodeKind::Folder)
    }
}

/// Snapshot of one node in the cloud tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudNode {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub kind: NodeKind,
    /// Name attribute, NFC-normalized by the node service.
    pub name: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Content fingerprint for files; folders carry none.
    pub fingerprint: Option<FileFingerprint>,
    /// Whether the node's content key has been applied (undecryptable nodes
    /// are skipped by the engine until the key arrives).
    pub key_applied: bool,
    /// Whether the node lives inside an inbound share.
    pub in_share: bool,
}

impl CloudNode {
    /// Convenience constructor for folders.
    #[must_use]
    pub fn folder(handle: NodeHandle, parent: Option<NodeHandle>, name: impl Into<String>) -> Self {
        Self {
            handle,
            parent,
            kind: NodeKind::Folder,
            name: name.into(),
            size: 0,
            mtime: DateTime::<Utc>::UNIX_EPOCH,
            fingerprint: None,
            key_applied: true,
            in_share: false,
        }
    }

    /// Convenience constructor for files.
    #[must_use]
    pub fn file(
        handle: NodeHandle,
        parent: NodeHandle,
        name: impl Into<String>,
        fingerprint: FileFingerprint,
    ) -> Self {
        Self {
            handle,
            parent: Some(parent),
            kind: NodeKind::File,
            name: name.into(),
            size: fingerprint.size,
            mtime: fingerprint.mtime,
            fingerprint: Some(fingerprint),
            key_applied: true,
            in_share: false,
        }
    }
}
