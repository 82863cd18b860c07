//! Actions emitted by a reconciliation tick
//!
//! A tick never performs I/O itself: it emits an ordered list of actions,
//! and the driver executes them through the ports in emission order, feeding
//! results back into the sync before the state cache commits. A tick over a
//! fully synced tree emits nothing.

use std::path::PathBuf;

use cirrus_core::domain::{FileFingerprint, NodeHandle, NodeKind, TransferId};

use crate::mirror::{MirrorId, TreeStateEvent};

/// One unit of work ordered by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    /// Refresh the snapshot of a cloud folder's children.
    FetchCloudChildren { handle: NodeHandle },

    /// Create a cloud node for `mirror` (folders; files go through uploads).
    CloudCreate {
        parent: NodeHandle,
        kind: NodeKind,
        name: String,
        mirror: MirrorId,
    },

    /// Rename a cloud node in place.
    CloudRename {
        handle: NodeHandle,
        new_name: String,
    },

    /// Re-parent a cloud node.
    CloudMove {
        handle: NodeHandle,
        new_parent: NodeHandle,
    },

    /// Move a cloud node to the server-side debris folder.
    CloudDebris { handle: NodeHandle },

    /// Create a local directory for `mirror`.
    LocalMkDir { path: PathBuf, mirror: MirrorId },

    /// Rename/move a local entity (cloud-side move propagated down).
    LocalRename {
        from: PathBuf,
        to: PathBuf,
        mirror: MirrorId,
    },

    /// Move a local entity into the sync's local debris.
    LocalDebris { path: PathBuf },

    /// Start uploading a file.
    StartUpload {
        path: PathBuf,
        parent: NodeHandle,
        name: String,
        fingerprint: FileFingerprint,
        mirror: MirrorId,
    },

    /// Start downloading a file node over `path`.
    StartDownload {
        handle: NodeHandle,
        path: PathBuf,
        mirror: MirrorId,
    },

    /// Cancel a transfer owned by this sync (shutdown, supersede).
    CancelTransfer { id: TransferId },
}

/// Everything a tick produced.
#[derive(Debug, Default)]
pub struct TickOutput {
    /// Work to execute, in order.
    pub actions: Vec<SyncAction>,
    /// Tree-state changes to report to the app.
    pub tree_events: Vec<TreeStateEvent>,
    /// A backup sync observed a remote-side change and must fault.
    pub backup_violation: bool,
    /// Rows deferred on the nagle delay; the driver should tick again soon.
    pub nagle_pending: bool,
    /// Rows deferred on gates, pending scans, or in-flight work; another
    /// tick is needed before the sync can settle.
    pub work_pending: bool,
    /// A config field the container must persist changed (backup state).
    pub config_changed: bool,
    /// The sync hit an unrecoverable condition and moved to `Failed`.
    pub fatal_error: Option<cirrus_core::domain::SyncError>,
}

impl TickOutput {
    /// Whether the tick did (or scheduled) anything at all.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.actions.is_empty()
            && !self.backup_violation
            && !self.nagle_pending
            && !self.work_pending
            && self.fatal_error.is_none()
    }
}
