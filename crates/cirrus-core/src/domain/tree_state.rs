//! Aggregated sync status of a subtree
//!
//! Tree-states join upward through the mirror tree with the order
//! `Syncing ≻ Pending ≻ Synced ≻ None`: a folder is syncing if any child is,
//! else pending if any child is, else synced.

use serde::{Deserialize, Serialize};

/// Sync status of one mirror node, aggregated over its subtree.
///
/// The derived `Ord` follows the join order, so `max` of two states is their
/// join.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TreeState {
    /// Nothing known / not participating.
    #[default]
    None,
    /// In sync with the cloud.
    Synced,
    /// Work queued but not started.
    Pending,
    /// Transfer or RPC in flight.
    Syncing,
}

impl TreeState {
    /// Join of two states under `Syncing ≻ Pending ≻ Synced ≻ None`.
    #[must_use]
    pub fn join(self, other: TreeState) -> TreeState {
        self.max(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_order() {
        use TreeState::*;
        assert_eq!(Synced.join(Pending), Pending);
        assert_eq!(Pending.join(Syncing), Syncing);
        assert_eq!(None.join(Synced), Synced);
        assert_eq!(Synced.join(Synced), Synced);
    }
}
