//! Read-mostly snapshot of the cloud subtree
//!
//! The engine never owns cloud state. This cache holds the nodes below one
//! sync's remote root as last fetched; the driver refreshes folders through
//! the `CloudClient` port and applies completed write operations here so the
//! next tick sees them.

use std::collections::{HashMap, HashSet};

use cirrus_core::domain::{CloudNode, NodeHandle};

/// Snapshot of the cloud nodes of one sync.
#[derive(Debug, Default)]
pub struct CloudCache {
    nodes: HashMap<NodeHandle, CloudNode>,
    /// Folders whose child set has been fetched at least once.
    known: HashSet<NodeHandle>,
}

impl CloudCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node(&self, handle: NodeHandle) -> Option<&CloudNode> {
        self.nodes.get(&handle)
    }

    /// Whether the children of `handle` are present in the snapshot.
    #[must_use]
    pub fn children_known(&self, handle: NodeHandle) -> bool {
        self.known.contains(&handle)
    }

    /// Children of a folder, in no particular order. Empty when unknown.
    #[must_use]
    pub fn children_of(&self, handle: NodeHandle) -> Vec<CloudNode> {
        self.nodes
            .values()
            .filter(|n| n.parent == Some(handle))
            .cloned()
            .collect()
    }

    /// Inserts or replaces a single node (applied RPC result).
    pub fn upsert(&mut self, node: CloudNode) {
        self.nodes.insert(node.handle, node);
    }

    /// Replaces the child set of a folder with a fetched listing.
    pub fn set_children(&mut self, parent: NodeHandle, children: Vec<CloudNode>) {
        // Drop stale entries of this parent that are no longer listed.
        let listed: HashSet<NodeHandle> = children.iter().map(|c| c.handle).collect();
        let stale: Vec<NodeHandle> = self
            .nodes
            .values()
            .filter(|n| n.parent == Some(parent) && !listed.contains(&n.handle))
            .map(|n| n.handle)
            .collect();
        for handle in stale {
            self.remove_subtree(handle);
        }
        for child in children {
            self.nodes.insert(child.handle, child);
        }
        self.known.insert(parent);
    }

    /// Forgets a folder's child set, forcing a refetch on the next tick.
    /// Called when the client learns of server-side changes.
    pub fn invalidate(&mut self, handle: NodeHandle) {
        self.known.remove(&handle);
    }

    /// Removes a node and everything below it.
    pub fn remove_subtree(&mut self, handle: NodeHandle) {
        let children: Vec<NodeHandle> = self
            .nodes
            .values()
            .filter(|n| n.parent == Some(handle))
            .map(|n| n.handle)
            .collect();
        for child in children {
            self.remove_subtree(child);
        }
        self.nodes.remove(&handle);
        self.known.remove(&handle);
    }

    /// Applies a rename that completed on the wire.
    pub fn apply_rename(&mut self, handle: NodeHandle, new_name: &str) {
        if let Some(node) = self.nodes.get_mut(&handle) {
            node.name = new_name.to_string();
        }
    }

    /// Applies a reparent that completed on the wire.
    pub fn apply_move(&mut self, handle: NodeHandle, new_parent: NodeHandle) {
        if let Some(node) = self.nodes.get_mut(&handle) {
            node.parent = Some(new_parent);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
