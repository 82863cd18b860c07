//! Per-tick gates and stall bookkeeping
//!
//! One `SyncFlags` per sync carries the gates that sequence a tick's phases
//! (scan → move → create/delete/transfer) and the stalled rows awaiting the
//! user. Gates computed at the end of one tick govern the next, so a move is
//! always recognized before the delete+create it would otherwise look like.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Why a row is waiting for the user (or for the other side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWaitReason {
    /// Both sides changed and the changes cannot be merged.
    BothChangedIncompatibly,
    /// Both sides changed with identical mtimes and tie-break is `Stall`.
    BothChangedTie,
    /// Multiple entries on one side collide on one comparison name.
    NameClash,
    /// Local and cloud move detection disagree about the same entity.
    MoveConflict,
    /// The scan target is unreachable.
    UnreachableTarget,
    /// Nothing drained for several ticks.
    NoProgress,
}

/// Gates and stall state of one sync, refreshed every tick.
#[derive(Debug, Default)]
pub struct SyncFlags {
    /// Whether the root scan target was reachable this tick.
    pub scan_target_reachable: bool,
    /// All scans complete at the end of the previous tick; moves may run.
    pub scanning_was_complete: bool,
    /// All moves complete at the end of the previous tick; creations,
    /// deletions and transfers may run.
    pub moves_were_complete: bool,
    /// No work was performed this tick although rows remain unsynced.
    pub no_progress: bool,
    /// Consecutive no-progress ticks.
    pub no_progress_count: u32,
    /// Stalled rows by local path.
    pub stalled_local_paths: BTreeMap<PathBuf, SyncWaitReason>,
    /// Stalled rows by cloud path.
    pub stalled_node_paths: BTreeMap<String, SyncWaitReason>,
}

impl SyncFlags {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scan_target_reachable: true,
            ..Self::default()
        }
    }

    /// Clears the per-tick state. Stalls re-accumulate during the pass, so a
    /// row that resolved itself disappears without explicit cleanup.
    pub fn begin_tick(&mut self) {
        self.scan_target_reachable = true;
        self.stalled_local_paths.clear();
        self.stalled_node_paths.clear();
    }

    /// Records the end-of-tick gate values for the next tick.
    pub fn end_tick(&mut self, scanning_complete: bool, moves_complete: bool, progressed: bool) {
        self.scanning_was_complete = scanning_complete;
        self.moves_were_complete = scanning_complete && moves_complete;
        self.no_progress = !progressed;
        if progressed {
            self.no_progress_count = 0;
        } else {
            self.no_progress_count += 1;
        }
    }

    #[must_use]
    pub fn stalled(&self) -> bool {
        !self.stalled_local_paths.is_empty() || !self.stalled_node_paths.is_empty()
    }

    pub fn stall_local(&mut self, path: PathBuf, reason: SyncWaitReason) {
        self.stalled_local_paths.insert(path, reason);
    }

    pub fn stall_node(&mut self, path: String, reason: SyncWaitReason) {
        self.stalled_node_paths.insert(path, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_carry_from_end_to_next_tick() {
        let mut flags = SyncFlags::new();
        assert!(!flags.scanning_was_complete);

        flags.end_tick(true, true, true);
        assert!(flags.scanning_was_complete);
        assert!(flags.moves_were_complete);

        // Moves can never be complete while scanning is not.
        flags.end_tick(false, true, true);
        assert!(!flags.moves_were_complete);
    }

    #[test]
    fn no_progress_counts_consecutive_ticks() {
        let mut flags = SyncFlags::new();
        flags.end_tick(true, true, false);
        flags.end_tick(true, true, false);
        assert_eq!(flags.no_progress_count, 2);
        flags.end_tick(true, true, true);
        assert_eq!(flags.no_progress_count, 0);
    }

    #[test]
    fn stalls_clear_on_begin_tick() {
        let mut flags = SyncFlags::new();
        flags.stall_local(PathBuf::from("/a"), SyncWaitReason::NameClash);
        assert!(flags.stalled());
        flags.begin_tick();
        assert!(!flags.stalled());
    }
}
