//! App notification port (driver-side callbacks)
//!
//! The containing client surfaces sync status to the user through these
//! callbacks. Implementations may be invoked from the client task only, but
//! must tolerate being called repeatedly with identical values (the engine
//! already de-duplicates state-config notifications; tree-state and stall
//! notifications follow their own cadence).

use std::path::Path;

use crate::domain::{BackupId, NodeKind, TreeState};

/// Callback surface into the application shell.
pub trait AppEventSink: Send + Sync {
    /// The aggregated tree-state of `path` changed.
    fn sync_tree_state(&self, backup_id: BackupId, path: &Path, state: TreeState, kind: NodeKind);

    /// A config field the app shows (error, enabled flag, backup state)
    /// changed. Fired exactly once per change.
    fn sync_state_config(&self, backup_id: BackupId);

    /// The set of stalled rows became non-empty (`true`) or drained (`false`).
    fn sync_stalled(&self, stalled: bool);

    /// The set of name-clash conflicts became non-empty or drained.
    fn sync_conflicts(&self, conflicts: bool);
}

/// Sink that ignores every notification. Useful for tools and tests that
/// exercise the engine without an app shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl AppEventSink for NullEventSink {
    fn sync_tree_state(&self, _: BackupId, _: &Path, _: TreeState, _: NodeKind) {}
    fn sync_state_config(&self, _: BackupId) {}
    fn sync_stalled(&self, _: bool) {}
    fn sync_conflicts(&self, _: bool) {}
}
