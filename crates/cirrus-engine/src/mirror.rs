//! The local mirror tree
//!
//! Shadow of the last-known synchronized state of one sync, kept in an arena
//! keyed by [`MirrorId`]. Parent/child links and the fsid and cloud-handle
//! indices are all id-based, so there is no ownership cycle between the
//! cloud snapshot and the mirror: each side holds plain handles into the
//! other.
//!
//! [`MirrorTree::set_parent_and_name`] is the single mutation point for a
//! node's place in the tree. It maintains the parent's child map, the
//! short-name alias map, and reports the cloud-side rename/move the caller
//! must issue when the node is bound.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cirrus_core::domain::{
    FileFingerprint, Fsid, MirrorRow, NodeHandle, NodeKind, TreeState,
};
use cirrus_fs::normalize_nfc;

// ============================================================================
// Identifiers and events
// ============================================================================

/// Arena id of a mirror node, unique within one sync for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MirrorId(pub u64);

/// Cloud-side operation implied by a tree mutation. The engine turns these
/// into actions; the tree itself never talks to ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudOp {
    Rename {
        handle: NodeHandle,
        new_name: String,
    },
    Move {
        handle: NodeHandle,
        new_parent: NodeHandle,
    },
}

/// A tree-state change that should be reported to the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStateEvent {
    pub path: PathBuf,
    pub state: TreeState,
    pub kind: NodeKind,
}

// ============================================================================
// MirrorNode
// ============================================================================

/// One entry of the mirror tree.
#[derive(Debug)]
pub struct MirrorNode {
    pub id: MirrorId,
    pub parent: Option<MirrorId>,
    pub kind: NodeKind,
    /// Leaf name in local encoding; for the root, the absolute local path.
    pub leaf_name: String,
    pub short_name: Option<String>,
    pub fsid: Option<Fsid>,
    /// Weak reference into the cloud snapshot; one-to-one per sync.
    pub cloud_handle: Option<NodeHandle>,
    /// Files only: last reconciled content version.
    pub fingerprint: Option<FileFingerprint>,
    pub tree_state: TreeState,
    /// Last state reported to the app, to avoid repeats.
    reported_state: TreeState,
    /// Created this run and not yet persisted anywhere.
    pub created: bool,
    /// Reported to the app as an error row.
    pub reported: bool,
    /// Verified against the cloud since loading from the state cache.
    pub checked: bool,
    pub needs_rescan: bool,
    /// Uploads wait until this instant so files still being written settle.
    pub nagle_until: Option<DateTime<Utc>>,
    /// Row id in the state cache, assigned on first persist.
    pub row_id: Option<i64>,
    pub syncable: bool,
    children: BTreeMap<String, MirrorId>,
    short_children: HashMap<String, MirrorId>,
}

impl MirrorNode {
    /// Children ids in deterministic (comparison-name) order.
    pub fn children(&self) -> impl Iterator<Item = (&String, &MirrorId)> {
        self.children.iter()
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

// ============================================================================
// MirrorTree
// ============================================================================

/// Report of a tree rebuilt from state-cache rows.
#[derive(Debug, Default)]
pub struct RebuildReport {
    /// Rows whose parent row was missing; dropped.
    pub orphans: usize,
    /// Nodes loaded with a cloud binding, to be re-checked against the cloud.
    pub bound: usize,
}

/// Arena of mirror nodes for one sync.
#[derive(Debug)]
pub struct MirrorTree {
    nodes: HashMap<MirrorId, MirrorNode>,
    by_fsid: HashMap<Fsid, MirrorId>,
    by_cloud: HashMap<NodeHandle, MirrorId>,
    root: MirrorId,
    next_id: u64,
    next_row_id: i64,
    case_insensitive: bool,
    /// Set during teardown to short-circuit state propagation.
    pub shutting_down: bool,
}

impl MirrorTree {
    /// Creates a tree holding only the sync root folder.
    pub fn new(root_path: &Path, case_insensitive: bool) -> Self {
        let root = MirrorId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            MirrorNode {
                id: root,
                parent: None,
                kind: NodeKind::Folder,
                leaf_name: root_path.to_string_lossy().into_owned(),
                short_name: None,
                fsid: None,
                cloud_handle: None,
                fingerprint: None,
                tree_state: TreeState::None,
                reported_state: TreeState::None,
                created: true,
                reported: false,
                checked: true,
                needs_rescan: true,
                nagle_until: None,
                row_id: None,
                syncable: true,
                children: BTreeMap::new(),
                short_children: HashMap::new(),
            },
        );
        Self {
            nodes,
            by_fsid: HashMap::new(),
            by_cloud: HashMap::new(),
            root,
            next_id: 2,
            next_row_id: 1,
            case_insensitive,
            shutting_down: false,
        }
    }

    #[must_use]
    pub fn root(&self) -> MirrorId {
        self.root
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, id: MirrorId) -> Option<&MirrorNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: MirrorId) -> Option<&mut MirrorNode> {
        self.nodes.get_mut(&id)
    }

    /// Comparison key for a name on this sync's filesystem.
    #[must_use]
    pub fn name_key(&self, name: &str) -> String {
        let normalized = normalize_nfc(name);
        if self.case_insensitive {
            normalized.to_lowercase()
        } else {
            normalized
        }
    }

    #[must_use]
    pub fn node_by_fsid(&self, fsid: Fsid) -> Option<MirrorId> {
        self.by_fsid.get(&fsid).copied()
    }

    #[must_use]
    pub fn node_by_cloud(&self, handle: NodeHandle) -> Option<MirrorId> {
        self.by_cloud.get(&handle).copied()
    }

    #[must_use]
    pub fn child_by_name(&self, parent: MirrorId, name: &str) -> Option<MirrorId> {
        let key = self.name_key(name);
        let node = self.nodes.get(&parent)?;
        node.children
            .get(&key)
            .or_else(|| node.short_children.get(name))
            .copied()
    }

    /// Absolute local path of a node: ancestors' leaf names joined, with the
    /// root's leaf name being the absolute root path.
    #[must_use]
    pub fn full_path(&self, id: MirrorId) -> PathBuf {
        let mut components = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            components.push(node.leaf_name.clone());
            cursor = node.parent;
        }
        let mut path = PathBuf::new();
        for component in components.iter().rev() {
            path.push(component);
        }
        path
    }

    /// Distance from the root; the root itself is depth 0.
    #[must_use]
    pub fn depth(&self, id: MirrorId) -> usize {
        let mut depth = 0;
        let mut cursor = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(current) = cursor {
            depth += 1;
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }
        depth
    }

    // ------------------------------------------------------------------
    // Construction and teardown
    // ------------------------------------------------------------------

    /// Attaches a new node under `parent`.
    pub fn add_child(
        &mut self,
        parent: MirrorId,
        kind: NodeKind,
        leaf_name: &str,
        short_name: Option<String>,
    ) -> MirrorId {
        let id = MirrorId(self.next_id);
        self.next_id += 1;

        let key = self.name_key(leaf_name);
        self.nodes.insert(
            id,
            MirrorNode {
                id,
                parent: Some(parent),
                kind,
                leaf_name: leaf_name.to_string(),
                short_name: short_name.clone(),
                fsid: None,
                cloud_handle: None,
                fingerprint: None,
                tree_state: TreeState::None,
                reported_state: TreeState::None,
                created: true,
                reported: false,
                checked: true,
                needs_rescan: kind == NodeKind::Folder,
                nagle_until: None,
                row_id: None,
                syncable: true,
                children: BTreeMap::new(),
                short_children: HashMap::new(),
            },
        );

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(key, id);
            if let Some(short) = short_name {
                parent_node.short_children.insert(short, id);
            }
        }
        id
    }

    /// Detaches and destroys a whole subtree, returning `(id, row_id)` of
    /// every removed node so the caller can queue state-cache deletions and
    /// cancel transfers.
    pub fn remove_subtree(&mut self, id: MirrorId) -> Vec<(MirrorId, Option<i64>)> {
        // Unlink from the parent first.
        if let Some(node) = self.nodes.get(&id) {
            let parent = node.parent;
            let key = self.name_key(&node.leaf_name);
            let short = node.short_name.clone();
            if let Some(parent_id) = parent {
                if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                    parent_node.children.remove(&key);
                    if let Some(short) = short {
                        parent_node.short_children.remove(&short);
                    }
                }
            }
        }

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.remove(&current) else {
                continue;
            };
            stack.extend(node.children.values().copied());
            if let Some(fsid) = node.fsid {
                if self.by_fsid.get(&fsid) == Some(&current) {
                    self.by_fsid.remove(&fsid);
                }
            }
            if let Some(handle) = node.cloud_handle {
                if self.by_cloud.get(&handle) == Some(&current) {
                    self.by_cloud.remove(&handle);
                }
            }
            removed.push((current, node.row_id));
        }
        removed
    }

    // ------------------------------------------------------------------
    // Index maintenance
    // ------------------------------------------------------------------

    /// Assigns a node's fsid, revoking any stale owner of the same id.
    pub fn set_fsid(&mut self, id: MirrorId, fsid: Fsid) {
        if let Some(previous) = self.by_fsid.insert(fsid, id) {
            if previous != id {
                debug!(?fsid, "fsid reassigned to a different mirror node");
                if let Some(node) = self.nodes.get_mut(&previous) {
                    if node.fsid == Some(fsid) {
                        node.fsid = None;
                    }
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            if let Some(old) = node.fsid {
                if old != fsid && self.by_fsid.get(&old) == Some(&id) {
                    self.by_fsid.remove(&old);
                }
            }
            node.fsid = Some(fsid);
        }
    }

    /// Binds a node to a cloud handle, enforcing one-to-one: a previous
    /// owner of the handle loses its binding.
    pub fn bind_cloud(&mut self, id: MirrorId, handle: NodeHandle) {
        if let Some(previous) = self.by_cloud.insert(handle, id) {
            if previous != id {
                warn!(%handle, "cloud handle rebound to a different mirror node");
                if let Some(node) = self.nodes.get_mut(&previous) {
                    if node.cloud_handle == Some(handle) {
                        node.cloud_handle = None;
                    }
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            if let Some(old) = node.cloud_handle {
                if old != handle && self.by_cloud.get(&old) == Some(&id) {
                    self.by_cloud.remove(&old);
                }
            }
            node.cloud_handle = Some(handle);
        }
    }

    pub fn unbind_cloud(&mut self, id: MirrorId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if let Some(handle) = node.cloud_handle.take() {
                if self.by_cloud.get(&handle) == Some(&id) {
                    self.by_cloud.remove(&handle);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Rename / move
    // ------------------------------------------------------------------

    /// Moves and/or renames a node. Updates the child maps on both parents
    /// and returns the cloud-side operations the caller must issue for a
    /// bound node whose cloud name or parent now differs.
    ///
    /// `issue_cloud_ops` is false when the mutation originates from the
    /// cloud (the rename already happened there); the tree updates silently.
    pub fn set_parent_and_name(
        &mut self,
        id: MirrorId,
        new_parent: MirrorId,
        new_leaf: &str,
        new_short: Option<String>,
        issue_cloud_ops: bool,
    ) -> Vec<CloudOp> {
        let mut ops = Vec::new();

        let Some(node) = self.nodes.get(&id) else {
            return ops;
        };
        let old_parent = node.parent;
        let old_key = self.name_key(&node.leaf_name);
        let old_short = node.short_name.clone();
        let name_changed = self.name_key(new_leaf) != old_key || node.leaf_name != new_leaf;
        let parent_changed = old_parent != Some(new_parent);
        let handle = node.cloud_handle;

        // Remove existing child linkage.
        if let Some(parent_id) = old_parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                parent_node.children.remove(&old_key);
                if let Some(short) = old_short {
                    parent_node.short_children.remove(&short);
                }
            }
        }

        // Cloud-side consequences, rename before reparent on the wire.
        if let Some(handle) = handle.filter(|_| issue_cloud_ops) {
            if name_changed {
                ops.push(CloudOp::Rename {
                    handle,
                    new_name: normalize_nfc(new_leaf),
                });
            }
            if parent_changed {
                if let Some(new_parent_handle) =
                    self.nodes.get(&new_parent).and_then(|p| p.cloud_handle)
                {
                    ops.push(CloudOp::Move {
                        handle,
                        new_parent: new_parent_handle,
                    });
                }
            }
        }

        let new_key = self.name_key(new_leaf);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.leaf_name = new_leaf.to_string();
            node.parent = Some(new_parent);
            node.short_name = new_short.clone();
        }
        if let Some(parent_node) = self.nodes.get_mut(&new_parent) {
            parent_node.children.insert(new_key, id);
            if let Some(short) = new_short {
                parent_node.short_children.insert(short, id);
            }
        }

        ops
    }

    // ------------------------------------------------------------------
    // Tree-state propagation
    // ------------------------------------------------------------------

    /// Sets a node's tree-state and propagates the join upward, emitting one
    /// event per node whose reported state changes.
    pub fn set_tree_state(
        &mut self,
        id: MirrorId,
        state: TreeState,
        events: &mut Vec<TreeStateEvent>,
    ) {
        if self.shutting_down {
            return;
        }

        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.tree_state = state;
        self.report_if_changed(id, events);

        // Recompute ancestors as the join of their children.
        let mut cursor = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(current) = cursor {
            let joined = self.check_state(current);
            let node = self
                .nodes
                .get_mut(&current)
                .expect("ancestor exists while walking up");
            let changed = node.tree_state != joined;
            node.tree_state = joined;
            self.report_if_changed(current, events);
            if !changed {
                break;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }
    }

    /// Join of a folder's children states; files report their own state.
    #[must_use]
    pub fn check_state(&self, id: MirrorId) -> TreeState {
        let Some(node) = self.nodes.get(&id) else {
            return TreeState::None;
        };
        if node.kind == NodeKind::File {
            return node.tree_state;
        }
        let mut state = TreeState::Synced;
        for child_id in node.children.values() {
            if let Some(child) = self.nodes.get(child_id) {
                state = state.join(child.tree_state);
                if state == TreeState::Syncing {
                    break;
                }
            }
        }
        state
    }

    fn report_if_changed(&mut self, id: MirrorId, events: &mut Vec<TreeStateEvent>) {
        let path = self.full_path(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.tree_state != node.reported_state {
                node.reported_state = node.tree_state;
                events.push(TreeStateEvent {
                    path,
                    state: node.tree_state,
                    kind: node.kind,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Rescan marking
    // ------------------------------------------------------------------

    /// Marks a node for rescan and propagates the mark to its ancestors so
    /// the recursion revisits the path down to it.
    pub fn mark_needs_rescan(&mut self, id: MirrorId) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get_mut(&current) else {
                break;
            };
            node.needs_rescan = true;
            cursor = node.parent;
        }
    }

    /// Marks a whole subtree (folders only unless `include_files`).
    pub fn mark_subtree_rescan(&mut self, id: MirrorId, include_files: bool) {
        self.mark_needs_rescan(id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            if node.kind == NodeKind::Folder || include_files {
                node.needs_rescan = true;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.values().copied());
            }
        }
    }

    /// Deepest mirror node covering `relative` (path relative to the root).
    /// Returns the closest existing ancestor when the exact entry is not in
    /// the tree yet.
    #[must_use]
    pub fn node_covering(&self, relative: &Path) -> MirrorId {
        let mut current = self.root;
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy();
            match self.child_by_name(current, &name) {
                Some(child) => current = child,
                None => break,
            }
        }
        // Files cannot be scanned; cover with the parent folder.
        if let Some(node) = self.nodes.get(&current) {
            if node.kind == NodeKind::File {
                if let Some(parent) = node.parent {
                    return parent;
                }
            }
        }
        current
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Assigns (if needed) and returns a node's state-cache row id.
    pub fn ensure_row_id(&mut self, id: MirrorId) -> i64 {
        if let Some(existing) = self.nodes.get(&id).and_then(|n| n.row_id) {
            return existing;
        }
        let row = self.next_row_id;
        self.next_row_id += 1;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.row_id = Some(row);
        }
        row
    }

    /// Serializes one node; the caller must have assigned row ids for it and
    /// its parent.
    #[must_use]
    pub fn to_row(&self, id: MirrorId) -> Option<MirrorRow> {
        let node = self.nodes.get(&id)?;
        let parent_row = match node.parent {
            Some(parent) => Some(self.nodes.get(&parent)?.row_id?),
            None => None,
        };
        Some(MirrorRow {
            row_id: node.row_id?,
            parent_row,
            kind: node.kind,
            size: node.fingerprint.map_or(0, |f| f.size),
            fsid: node.fsid,
            cloud_handle: node.cloud_handle,
            leaf_name: node.leaf_name.clone(),
            short_name: node.short_name.clone(),
            fingerprint: node.fingerprint,
            syncable: node.syncable,
        })
    }

    /// Rebuilds a tree bottom-up from state-cache rows.
    ///
    /// The root row is the one without a parent. Loaded nodes have `checked`
    /// unset when bound to a cloud handle; the engine re-verifies those
    /// bindings before trusting them.
    pub fn from_rows(
        root_path: &Path,
        case_insensitive: bool,
        rows: &[MirrorRow],
    ) -> (Self, RebuildReport) {
        let mut tree = Self::new(root_path, case_insensitive);
        let mut report = RebuildReport::default();

        let root_row = rows.iter().find(|r| r.parent_row.is_none());
        let mut by_row: HashMap<i64, MirrorId> = HashMap::new();

        if let Some(root_row) = root_row {
            let root = tree.root;
            by_row.insert(root_row.row_id, root);
            tree.next_row_id = rows.iter().map(|r| r.row_id).max().unwrap_or(0) + 1;
            if let Some(node) = tree.nodes.get_mut(&root) {
                node.row_id = Some(root_row.row_id);
                node.created = false;
            }
            if let Some(fsid) = root_row.fsid {
                tree.set_fsid(root, fsid);
            }
            if let Some(handle) = root_row.cloud_handle {
                tree.bind_cloud(root, handle);
                report.bound += 1;
            }
        }

        // Attach children in passes until no progress: rows are not
        // guaranteed to arrive parents-first.
        let mut remaining: Vec<&MirrorRow> =
            rows.iter().filter(|r| r.parent_row.is_some()).collect();
        loop {
            let before = remaining.len();
            remaining.retain(|row| {
                let parent_row = row.parent_row.expect("filtered to Some above");
                let Some(&parent_id) = by_row.get(&parent_row) else {
                    return true;
                };
                let id = tree.add_child(parent_id, row.kind, &row.leaf_name, row.short_name.clone());
                if let Some(node) = tree.nodes.get_mut(&id) {
                    node.row_id = Some(row.row_id);
                    node.fingerprint = row.fingerprint;
                    node.syncable = row.syncable;
                    node.created = false;
                    node.checked = row.cloud_handle.is_none();
                    node.needs_rescan = row.kind == NodeKind::Folder;
                }
                if let Some(fsid) = row.fsid {
                    tree.set_fsid(id, fsid);
                }
                if let Some(handle) = row.cloud_handle {
                    tree.bind_cloud(id, handle);
                    report.bound += 1;
                }
                by_row.insert(row.row_id, id);
                false
            });
            if remaining.len() == before {
                break;
            }
        }
        report.orphans = remaining.len();
        if report.orphans > 0 {
            warn!(orphans = report.orphans, "dropped orphaned state-cache rows");
        }

        (tree, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> MirrorTree {
        MirrorTree::new(Path::new("/sync/root"), false)
    }

    #[test]
    fn root_is_the_only_parentless_node() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::Folder, "a", None);
        let b = t.add_child(a, NodeKind::File, "b.txt", None);
        assert!(t.node(t.root()).unwrap().is_root());
        assert!(!t.node(a).unwrap().is_root());
        assert!(!t.node(b).unwrap().is_root());
    }

    #[test]
    fn full_path_joins_leaf_names() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::Folder, "docs", None);
        let b = t.add_child(a, NodeKind::File, "report.pdf", None);
        assert_eq!(t.full_path(b), PathBuf::from("/sync/root/docs/report.pdf"));
        assert_eq!(t.depth(b), 2);
    }

    #[test]
    fn fsid_index_is_one_to_one() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::File, "a", None);
        let b = t.add_child(t.root(), NodeKind::File, "b", None);

        t.set_fsid(a, Fsid::new(100));
        assert_eq!(t.node_by_fsid(Fsid::new(100)), Some(a));

        // Reassigning the fsid revokes the old owner.
        t.set_fsid(b, Fsid::new(100));
        assert_eq!(t.node_by_fsid(Fsid::new(100)), Some(b));
        assert_eq!(t.node(a).unwrap().fsid, None);
    }

    #[test]
    fn cloud_binding_is_one_to_one() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::File, "a", None);
        let b = t.add_child(t.root(), NodeKind::File, "b", None);

        t.bind_cloud(a, NodeHandle::new(5));
        t.bind_cloud(b, NodeHandle::new(5));
        assert_eq!(t.node_by_cloud(NodeHandle::new(5)), Some(b));
        assert_eq!(t.node(a).unwrap().cloud_handle, None);
    }

    #[test]
    fn rename_emits_cloud_rename_for_bound_node() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::File, "old.txt", None);
        t.bind_cloud(a, NodeHandle::new(9));

        let root = t.root();
        let ops = t.set_parent_and_name(a, root, "new.txt", None, true);
        assert_eq!(
            ops,
            vec![CloudOp::Rename {
                handle: NodeHandle::new(9),
                new_name: "new.txt".into()
            }]
        );
        assert_eq!(t.child_by_name(root, "new.txt"), Some(a));
        assert_eq!(t.child_by_name(root, "old.txt"), None);
    }

    #[test]
    fn move_emits_cloud_move_when_both_parents_bound() {
        let mut t = tree();
        let src = t.add_child(t.root(), NodeKind::Folder, "src", None);
        let dst = t.add_child(t.root(), NodeKind::Folder, "dst", None);
        let f = t.add_child(src, NodeKind::File, "f.txt", None);
        t.bind_cloud(dst, NodeHandle::new(20));
        t.bind_cloud(f, NodeHandle::new(30));

        let ops = t.set_parent_and_name(f, dst, "f.txt", None, true);
        assert_eq!(
            ops,
            vec![CloudOp::Move {
                handle: NodeHandle::new(30),
                new_parent: NodeHandle::new(20)
            }]
        );
        assert_eq!(t.full_path(f), PathBuf::from("/sync/root/dst/f.txt"));
    }

    #[test]
    fn unbound_rename_emits_nothing() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::File, "x", None);
        let root = t.root();
        assert!(t.set_parent_and_name(a, root, "y", None, true).is_empty());
    }

    #[test]
    fn tree_state_joins_upward() {
        let mut t = tree();
        let folder = t.add_child(t.root(), NodeKind::Folder, "d", None);
        let f1 = t.add_child(folder, NodeKind::File, "a", None);
        let f2 = t.add_child(folder, NodeKind::File, "b", None);

        let mut events = Vec::new();
        t.set_tree_state(f1, TreeState::Synced, &mut events);
        t.set_tree_state(f2, TreeState::Syncing, &mut events);
        assert_eq!(t.node(folder).unwrap().tree_state, TreeState::Syncing);

        t.set_tree_state(f2, TreeState::Synced, &mut events);
        assert_eq!(t.node(folder).unwrap().tree_state, TreeState::Synced);
        assert_eq!(t.node(t.root()).unwrap().tree_state, TreeState::Synced);
    }

    #[test]
    fn tree_state_events_fire_once_per_change() {
        let mut t = tree();
        let f = t.add_child(t.root(), NodeKind::File, "a", None);

        let mut events = Vec::new();
        t.set_tree_state(f, TreeState::Syncing, &mut events);
        let first = events.len();
        assert!(first >= 1);

        t.set_tree_state(f, TreeState::Syncing, &mut events);
        assert_eq!(events.len(), first);
    }

    #[test]
    fn needs_rescan_propagates_to_ancestors_only() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::Folder, "a", None);
        let b = t.add_child(a, NodeKind::Folder, "b", None);
        let sibling = t.add_child(a, NodeKind::Folder, "c", None);
        // Fresh folders start marked; clear for the test.
        for id in [t.root(), a, b, sibling] {
            t.node_mut(id).unwrap().needs_rescan = false;
        }

        t.mark_needs_rescan(b);
        assert!(t.node(b).unwrap().needs_rescan);
        assert!(t.node(a).unwrap().needs_rescan);
        assert!(t.node(t.root()).unwrap().needs_rescan);
        assert!(!t.node(sibling).unwrap().needs_rescan);
    }

    #[test]
    fn node_covering_walks_down_to_deepest_match() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::Folder, "a", None);
        let b = t.add_child(a, NodeKind::Folder, "b", None);

        assert_eq!(t.node_covering(Path::new("a/b")), b);
        assert_eq!(t.node_covering(Path::new("a/b/unknown.txt")), b);
        assert_eq!(t.node_covering(Path::new("zzz")), t.root());
    }

    #[test]
    fn node_covering_a_file_returns_its_folder() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::Folder, "a", None);
        let _f = t.add_child(a, NodeKind::File, "f.txt", None);
        assert_eq!(t.node_covering(Path::new("a/f.txt")), a);
    }

    #[test]
    fn case_insensitive_lookup() {
        let mut t = MirrorTree::new(Path::new("/r"), true);
        let a = t.add_child(t.root(), NodeKind::File, "Photo.JPG", None);
        assert_eq!(t.child_by_name(t.root(), "photo.jpg"), Some(a));
    }

    #[test]
    fn remove_subtree_cleans_indices() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::Folder, "a", None);
        let b = t.add_child(a, NodeKind::File, "b", None);
        t.set_fsid(b, Fsid::new(7));
        t.bind_cloud(b, NodeHandle::new(8));

        let removed = t.remove_subtree(a);
        assert_eq!(removed.len(), 2);
        assert!(t.node_by_fsid(Fsid::new(7)).is_none());
        assert!(t.node_by_cloud(NodeHandle::new(8)).is_none());
        assert_eq!(t.child_by_name(t.root(), "a"), None);
    }

    #[test]
    fn rows_roundtrip_rebuilds_the_tree() {
        let mut t = tree();
        let a = t.add_child(t.root(), NodeKind::Folder, "docs", None);
        let b = t.add_child(a, NodeKind::File, "x.txt", None);
        t.set_fsid(b, Fsid::new(50));
        t.bind_cloud(b, NodeHandle::new(60));

        for id in [t.root(), a, b] {
            t.ensure_row_id(id);
        }
        let rows: Vec<MirrorRow> = [t.root(), a, b]
            .iter()
            .map(|id| t.to_row(*id).unwrap())
            .collect();

        let (rebuilt, report) = MirrorTree::from_rows(Path::new("/sync/root"), false, &rows);
        assert_eq!(rebuilt.len(), 3);
        assert_eq!(report.orphans, 0);
        assert_eq!(report.bound, 1);

        let a2 = rebuilt.child_by_name(rebuilt.root(), "docs").unwrap();
        let b2 = rebuilt.child_by_name(a2, "x.txt").unwrap();
        assert_eq!(rebuilt.node(b2).unwrap().fsid, Some(Fsid::new(50)));
        assert_eq!(rebuilt.node_by_cloud(NodeHandle::new(60)), Some(b2));
        // Bound nodes come back unchecked until verified against the cloud.
        assert!(!rebuilt.node(b2).unwrap().checked);
    }

    #[test]
    fn orphan_rows_are_dropped() {
        let rows = vec![
            MirrorRow {
                row_id: 1,
                parent_row: None,
                kind: NodeKind::Folder,
                size: 0,
                fsid: None,
                cloud_handle: None,
                leaf_name: "/sync/root".into(),
                short_name: None,
                fingerprint: None,
                syncable: true,
            },
            MirrorRow {
                row_id: 5,
                parent_row: Some(99),
                kind: NodeKind::File,
                size: 1,
                fsid: None,
                cloud_handle: None,
                leaf_name: "lost.txt".into(),
                short_name: None,
                fingerprint: None,
                syncable: true,
            },
        ];
        let (rebuilt, report) = MirrorTree::from_rows(Path::new("/sync/root"), false, &rows);
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(report.orphans, 1);
    }
}
