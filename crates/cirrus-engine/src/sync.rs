//! One running sync
//!
//! `Sync` owns the mirror tree, the cloud snapshot, and the per-tick gates
//! of one configured sync. A tick is a synchronous pass: it drains change
//! notifications into rescan marks, walks the mirror tree pre-order, builds
//! triplets at every folder, and dispatches each row to exactly one
//! resolver. The pass performs no I/O; it emits [`SyncAction`]s that the
//! driver executes through the ports, feeding completions back through the
//! `note_*` methods before the state cache commits.
//!
//! Phase gates sequence work across ticks: moves are only recognized once
//! scanning was complete, and creations/deletions/transfers only run once
//! moves were complete. This is what keeps the transient "file missing"
//! window of a move from being misread as delete+create.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use glob::Pattern;
use tracing::{debug, info, trace, warn};

use cirrus_core::domain::{
    BackupState, CloudNode, FileFingerprint, Fsid, MirrorRow, NodeHandle, NodeKind, SyncConfig,
    SyncError, TransferId, TreeState,
};
use cirrus_fs::debris::DEBRIS_DIR_NAME;
use cirrus_fs::{escape_name, normalize_nfc, unescape_name, DirNotifier, FsEntry, FsKind, LocalDebris, NotifyQueue};
use cirrus_scan::{ScanRequest, ScanService};

use crate::actions::{SyncAction, TickOutput};
use crate::cloud_cache::CloudCache;
use crate::flags::{SyncFlags, SyncWaitReason};
use crate::mirror::{CloudOp, MirrorId, MirrorTree, RebuildReport};
use crate::triplet::{compute_sync_triplets, SyncRow};

// ============================================================================
// Tuning constants
// ============================================================================

/// Files whose mtime is this close to "now" may still be written to; their
/// upload waits one round.
const NAGLE_DELAY_MS: i64 = 1100;

/// Notifications younger than this are left queued so bursts settle.
const NOTIFY_SETTLE_MS: i64 = 500;

/// Extra settle applied to the retry queue.
const RETRY_DELAY_MS: i64 = 4000;

/// Consecutive unreachable-root ticks before the sync faults.
const ROOT_GONE_TICKS: u32 = 5;

/// Consecutive no-progress ticks before escalating to a full rescan.
const NO_PROGRESS_RESCAN_TICKS: u32 = 8;

/// Ticks between full rescans while the notifier is failed.
const FULL_RESCAN_INTERVAL_TICKS: u32 = 16;

// ============================================================================
// Sync state machine
// ============================================================================

/// Coarse lifecycle state of a running sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disabled,
    LoadingState,
    InitialScan,
    Active,
    Stalled,
    Failed,
}

impl SyncState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SyncState::Disabled => "disabled",
            SyncState::LoadingState => "loading",
            SyncState::InitialScan => "initial-scan",
            SyncState::Active => "active",
            SyncState::Stalled => "stalled",
            SyncState::Failed => "failed",
        }
    }
}

/// Per-pass scratch state.
struct TickCtx {
    now: DateTime<Utc>,
    scanning_complete: bool,
    moves_complete: bool,
    progressed: bool,
    deferred: bool,
}

/// What a row resolver decided about recursion.
type Recurse = Option<(MirrorId, Option<NodeHandle>, PathBuf)>;

// ============================================================================
// Sync
// ============================================================================

/// A running sync: mirror tree + cloud snapshot + reconciliation state.
pub struct Sync {
    pub config: SyncConfig,
    pub state: SyncState,
    pub mirror: MirrorTree,
    pub cloud: CloudCache,
    pub flags: SyncFlags,
    pub notifier: Box<dyn DirNotifier>,

    insertq: HashSet<MirrorId>,
    deleteq: HashSet<i64>,

    scan_requests: HashMap<MirrorId, Arc<ScanRequest>>,
    scan_results: HashMap<MirrorId, Vec<FsEntry>>,
    pending_fetches: HashSet<NodeHandle>,
    /// Mirror nodes with a cloud create / transfer / mkdir in flight.
    pending_ops: HashSet<MirrorId>,
    in_flight: HashMap<TransferId, MirrorId>,

    exclusions: Vec<Pattern>,
    pub fs_kind: FsKind,
    case_insensitive: bool,
    debris: Option<LocalDebris>,

    root_unreachable_ticks: u32,
    full_rescan_countdown: u32,
    pub shutting_down: bool,
}

impl Sync {
    /// Builds a fresh sync (no state cache). `root_cloud` is the resolved
    /// remote root node.
    pub fn new(config: SyncConfig, notifier: Box<dyn DirNotifier>, root_cloud: CloudNode) -> Self {
        let fs_kind = cirrus_fs::fskind::detect_fs_kind(&config.local_path);
        let mirror = MirrorTree::new(&config.local_path, fs_kind.is_case_insensitive());
        Self::finish_construction(config, notifier, root_cloud, mirror, fs_kind)
    }

    /// Rebuilds a sync from state-cache rows.
    pub fn from_rows(
        config: SyncConfig,
        notifier: Box<dyn DirNotifier>,
        root_cloud: CloudNode,
        rows: &[MirrorRow],
    ) -> (Self, RebuildReport) {
        let fs_kind = cirrus_fs::fskind::detect_fs_kind(&config.local_path);
        let (mirror, report) =
            MirrorTree::from_rows(&config.local_path, fs_kind.is_case_insensitive(), rows);
        let sync = Self::finish_construction(config, notifier, root_cloud, mirror, fs_kind);
        (sync, report)
    }

    fn finish_construction(
        config: SyncConfig,
        notifier: Box<dyn DirNotifier>,
        root_cloud: CloudNode,
        mut mirror: MirrorTree,
        fs_kind: FsKind,
    ) -> Self {
        let case_insensitive = fs_kind.is_case_insensitive();
        let root = mirror.root();
        mirror.bind_cloud(root, root_cloud.handle);
        if let Ok(st) = cirrus_fs::stat(&config.local_path) {
            mirror.set_fsid(root, st.fsid);
        }
        mirror.mark_needs_rescan(root);

        let mut cloud = CloudCache::new();
        cloud.upsert(root_cloud);

        let debris = match LocalDebris::open(&config.local_path) {
            Ok(d) => Some(d),
            Err(err) => {
                warn!(
                    sync = %config.name,
                    error = %err,
                    "could not open local debris folder"
                );
                None
            }
        };

        let exclusions = config
            .exclusions
            .iter()
            .filter_map(|pattern| match Pattern::new(pattern) {
                Ok(p) => Some(p),
                Err(err) => {
                    warn!(pattern, error = %err, "skipping invalid exclusion pattern");
                    None
                }
            })
            .collect();

        let mut sync = Self {
            config,
            state: SyncState::InitialScan,
            mirror,
            cloud,
            flags: SyncFlags::new(),
            notifier,
            insertq: HashSet::new(),
            deleteq: HashSet::new(),
            scan_requests: HashMap::new(),
            scan_results: HashMap::new(),
            pending_fetches: HashSet::new(),
            pending_ops: HashSet::new(),
            in_flight: HashMap::new(),
            exclusions,
            fs_kind,
            case_insensitive,
            debris,
            root_unreachable_ticks: 0,
            full_rescan_countdown: FULL_RESCAN_INTERVAL_TICKS,
            shutting_down: false,
        };
        let root = sync.mirror.root();
        sync.statecache_add(root);
        sync
    }

    #[must_use]
    pub fn backup_id(&self) -> cirrus_core::domain::BackupId {
        self.config.backup_id
    }

    /// Whether the sync should be ticked at all.
    #[must_use]
    pub fn active(&self) -> bool {
        matches!(
            self.state,
            SyncState::InitialScan | SyncState::Active | SyncState::Stalled
        )
    }

    #[must_use]
    pub fn is_backup(&self) -> bool {
        self.config.is_backup()
    }

    /// Transfers currently owned by this sync.
    #[must_use]
    pub fn in_flight_transfers(&self) -> Vec<TransferId> {
        self.in_flight.keys().copied().collect()
    }

    /// Whether a transfer belongs to this sync.
    #[must_use]
    pub fn owns_transfer(&self, id: TransferId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Pending scan requests (for heartbeats).
    #[must_use]
    pub fn pending_scans(&self) -> usize {
        self.scan_requests.len()
    }

    // ==================================================================
    // Tick
    // ==================================================================

    /// Runs one reconciliation pass. Pure with respect to I/O: all effects
    /// are in the returned [`TickOutput`].
    pub fn tick(&mut self, scan: &ScanService, now: DateTime<Utc>) -> TickOutput {
        let mut out = TickOutput::default();
        if !self.active() {
            return out;
        }

        self.proc_notifications(now);
        self.flags.begin_tick();

        let mut ctx = TickCtx {
            now,
            scanning_complete: true,
            moves_complete: true,
            progressed: false,
            deferred: false,
        };

        let root = self.mirror.root();
        let root_handle = self.mirror.node(root).and_then(|n| n.cloud_handle);
        let root_path = self.mirror.full_path(root);
        self.recursive_sync(root, root_handle, &root_path, scan, &mut ctx, &mut out);

        // Root reachability policy: bounded retries, then fault.
        if self.flags.scan_target_reachable {
            self.root_unreachable_ticks = 0;
        } else {
            self.root_unreachable_ticks += 1;
            if self.root_unreachable_ticks >= ROOT_GONE_TICKS {
                warn!(sync = %self.config.name, "local sync root is gone, failing sync");
                self.state = SyncState::Failed;
                out.fatal_error = Some(SyncError::LocalPathUnavailable);
                return out;
            }
            ctx.deferred = true;
        }

        let progressed = ctx.progressed || !out.actions.is_empty();
        self.flags
            .end_tick(ctx.scanning_complete, ctx.moves_complete, progressed);

        // Escalate a wedged sync to a full rescan.
        if !progressed
            && ctx.deferred
            && self.flags.no_progress_count >= NO_PROGRESS_RESCAN_TICKS
        {
            info!(sync = %self.config.name, "no progress, escalating to full rescan");
            self.mirror.mark_subtree_rescan(root, false);
            self.flags.no_progress_count = 0;
        }

        out.work_pending = ctx.deferred || !ctx.scanning_complete || !ctx.moves_complete;

        // State machine.
        if self.flags.stalled() {
            self.state = SyncState::Stalled;
        } else if self.state == SyncState::Stalled {
            self.state = SyncState::Active;
        } else if self.state == SyncState::InitialScan && self.flags.scanning_was_complete {
            self.state = SyncState::Active;
        }

        // A backup switches from mirroring to monitoring once the initial
        // mirror has fully settled.
        if self.is_backup()
            && self.config.backup_state == BackupState::Mirroring
            && self.flags.scanning_was_complete
            && self.flags.moves_were_complete
            && !out.work_pending
            && out.actions.is_empty()
            && self
                .mirror
                .node(root)
                .map_or(false, |n| {
                    n.tree_state == TreeState::Synced || n.child_count() == 0
                })
        {
            info!(sync = %self.config.name, "backup mirror complete, now monitoring");
            self.config.backup_state = BackupState::Monitoring;
            out.config_changed = true;
        }

        out
    }

    // ==================================================================
    // Notification intake
    // ==================================================================

    /// Drains settled notifications into rescan marks. While the notifier is
    /// failed, schedules periodic full rescans instead.
    fn proc_notifications(&mut self, now: DateTime<Utc>) {
        if self.notifier.failed() {
            self.full_rescan_countdown = self.full_rescan_countdown.saturating_sub(1);
            if self.full_rescan_countdown == 0 {
                trace!(sync = %self.config.name, "notifier failed; periodic full rescan");
                let root = self.mirror.root();
                self.mirror.mark_subtree_rescan(root, false);
                self.full_rescan_countdown = FULL_RESCAN_INTERVAL_TICKS;
            }
        }

        for (queue, settle_ms) in [
            (NotifyQueue::DirEvents, NOTIFY_SETTLE_MS),
            (NotifyQueue::Extra, NOTIFY_SETTLE_MS),
            (NotifyQueue::Retry, RETRY_DELAY_MS),
        ] {
            while let Some(notification) = self.notifier.pop(queue) {
                if notification.timestamp + Duration::milliseconds(settle_ms) > now {
                    // Not settled yet; requeue at the tail and stop.
                    self.notifier.push(notification);
                    break;
                }
                let covering = self.mirror.node_covering(&notification.relative_path);
                if notification.deep {
                    self.mirror.mark_subtree_rescan(covering, false);
                } else {
                    self.mirror.mark_needs_rescan(covering);
                }
            }
        }

        // Debris events are ours; drop them.
        while self.notifier.pop(NotifyQueue::Debris).is_some() {}
    }

    // ==================================================================
    // Recursion
    // ==================================================================

    fn recursive_sync(
        &mut self,
        id: MirrorId,
        cloud_handle: Option<NodeHandle>,
        path: &Path,
        scan: &ScanService,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) {
        let Some(fs_children) = self.fs_children_for(id, path, scan, ctx) else {
            return;
        };

        let cloud_children = match cloud_handle {
            Some(handle) => {
                if self.cloud.children_known(handle) {
                    self.cloud.children_of(handle)
                } else {
                    if self.pending_fetches.insert(handle) {
                        out.actions.push(SyncAction::FetchCloudChildren { handle });
                    }
                    ctx.scanning_complete = false;
                    ctx.deferred = true;
                    return;
                }
            }
            None => Vec::new(),
        };

        let child_ids: Vec<MirrorId> = self
            .mirror
            .node(id)
            .map(|n| n.children().map(|(_, c)| *c).collect())
            .unwrap_or_default();
        let mirror_children: Vec<(String, MirrorId)> = child_ids
            .iter()
            .filter_map(|c| self.mirror.node(*c).map(|n| (n.leaf_name.clone(), *c)))
            .collect();

        let rows = compute_sync_triplets(
            cloud_children,
            mirror_children,
            fs_children,
            self.fs_kind,
            self.case_insensitive,
        );

        for mut row in rows {
            if self.row_is_excluded(&row) {
                continue;
            }
            if row.has_clashes() {
                let name = row.display_name();
                let node_path = self.cloud_path_of(path, &name);
                self.flags
                    .stall_local(path.join(&name), SyncWaitReason::NameClash);
                self.flags.stall_node(node_path, SyncWaitReason::NameClash);
                continue;
            }

            // Moves run strictly after scanning completed.
            if self.flags.scanning_was_complete {
                if self.check_moves(&mut row, id, path, ctx, out) {
                    continue;
                }
            } else if row.fs.is_some() || row.cloud.is_some() {
                ctx.moves_complete = false;
            }

            if let Some((child, child_handle, child_path)) =
                self.sync_item(row, id, cloud_handle, path, ctx, out)
            {
                self.recursive_sync(child, child_handle, &child_path, scan, ctx, out);
            }
        }
    }

    /// Current filesystem children of a folder, requesting or consuming an
    /// asynchronous scan as needed. `None` defers the folder this tick.
    fn fs_children_for(
        &mut self,
        id: MirrorId,
        path: &Path,
        scan: &ScanService,
        ctx: &mut TickCtx,
    ) -> Option<Vec<FsEntry>> {
        let needs_rescan = self.mirror.node(id).map_or(false, |n| n.needs_rescan);
        let cached = self.scan_results.contains_key(&id);

        if needs_rescan || !cached {
            match self.scan_requests.get(&id) {
                Some(request) if request.completed() => {
                    let request = self
                        .scan_requests
                        .remove(&id)
                        .expect("request present in map");
                    if !request.was_reachable() {
                        if id == self.mirror.root() {
                            self.flags.scan_target_reachable = false;
                        } else {
                            // The folder vanished; its parent row resolves it.
                            if let Some(parent) = self.mirror.node(id).and_then(|n| n.parent) {
                                self.mirror.mark_needs_rescan(parent);
                            }
                        }
                        ctx.scanning_complete = false;
                        ctx.deferred = true;
                        return None;
                    }
                    let mut results = request.take_results();
                    self.filter_scan_results(id, &mut results);
                    self.scan_results.insert(id, results);
                    if let Some(node) = self.mirror.node_mut(id) {
                        node.needs_rescan = false;
                    }
                    ctx.progressed = true;
                }
                Some(_) => {
                    ctx.scanning_complete = false;
                    ctx.deferred = true;
                    return None;
                }
                None => {
                    trace!(path = %path.display(), "requesting scan");
                    let request =
                        scan.scan(id.0, path.to_path_buf(), self.config.follow_symlinks);
                    self.scan_requests.insert(id, request);
                    ctx.scanning_complete = false;
                    ctx.deferred = true;
                    return None;
                }
            }
        }

        Some(self.scan_results.get(&id).cloned().unwrap_or_default())
    }

    /// Removes entries the engine must not look at: the debris folder, the
    /// exclusion patterns, and unfollowed symlinks.
    fn filter_scan_results(&self, id: MirrorId, results: &mut Vec<FsEntry>) {
        let is_root = id == self.mirror.root();
        results.retain(|entry| {
            if is_root && entry.name == DEBRIS_DIR_NAME {
                return false;
            }
            if entry.is_symlink && !self.config.follow_symlinks {
                return false;
            }
            !self.name_is_excluded(&entry.name)
        });
    }

    fn name_is_excluded(&self, name: &str) -> bool {
        self.exclusions.iter().any(|p| p.matches(name))
    }

    fn row_is_excluded(&self, row: &SyncRow) -> bool {
        let name = row.display_name();
        !name.is_empty() && self.name_is_excluded(&name)
    }

    fn cloud_path_of(&self, parent_path: &Path, name: &str) -> String {
        let relative = parent_path
            .join(name)
            .strip_prefix(&self.config.local_path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| name.to_string());
        format!("{}/{relative}", self.config.remote_path_hint)
    }

    // ==================================================================
    // Move / rename detection
    // ==================================================================

    /// Detects moves and renames before the resolver table runs. Returns
    /// true when the row was consumed by a move.
    fn check_moves(
        &mut self,
        row: &mut SyncRow,
        parent_id: MirrorId,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> bool {
        // Local side: an fs entry whose fsid belongs to a mirror node that
        // lives elsewhere is that node, moved or renamed.
        if let Some(fs) = row.fs.clone() {
            if self.fs_kind.has_stable_fsids() {
                if let Some(source) = self.mirror.node_by_fsid(fs.fsid) {
                    let same_place = row.mirror == Some(source)
                        || self.mirror.node(source).map_or(true, |n| {
                            n.parent == Some(parent_id)
                                && self.mirror.name_key(&n.leaf_name)
                                    == self.mirror.name_key(&fs.name)
                        });
                    let kind_matches =
                        self.mirror.node(source).map(|n| n.kind) == Some(fs.kind);
                    if !same_place && kind_matches {
                        if row.mirror.is_some() {
                            // Moving onto a name that still has its own node:
                            // both sides must agree before we touch anything.
                            self.flags.stall_local(
                                parent_path.join(&fs.name),
                                SyncWaitReason::MoveConflict,
                            );
                            ctx.moves_complete = false;
                            return true;
                        }
                        debug!(
                            sync = %self.config.name,
                            from = %self.mirror.full_path(source).display(),
                            to = %parent_path.join(&fs.name).display(),
                            "local move detected"
                        );
                        let old_parent = self.mirror.node(source).and_then(|n| n.parent);
                        let ops = self.mirror.set_parent_and_name(
                            source,
                            parent_id,
                            &fs.name,
                            fs.short_name.clone(),
                            true,
                        );
                        self.push_cloud_ops(ops, out);
                        self.mirror.set_fsid(source, fs.fsid);
                        self.statecache_add(source);
                        self.mirror
                            .set_tree_state(source, TreeState::Pending, &mut out.tree_events);
                        // Both folders changed; stale listings must not be
                        // trusted for another move pass.
                        if let Some(old_parent) = old_parent {
                            self.mirror.mark_needs_rescan(old_parent);
                        }
                        self.mirror.mark_needs_rescan(parent_id);
                        ctx.progressed = true;
                        return true;
                    }
                }
            }
        }

        // Cloud side: a cloud node bound to a mirror node that lives
        // elsewhere was moved or renamed remotely.
        if let Some(cloud) = row.cloud.clone() {
            if let Some(source) = self.mirror.node_by_cloud(cloud.handle) {
                let local_name = escape_name(&cloud.name, self.fs_kind);
                let same_place = row.mirror == Some(source)
                    || self.mirror.node(source).map_or(true, |n| {
                        n.parent == Some(parent_id)
                            && self.mirror.name_key(&n.leaf_name)
                                == self.mirror.name_key(&local_name)
                    });
                if !same_place {
                    if self.is_backup() {
                        out.backup_violation = true;
                        return true;
                    }
                    if row.mirror.is_some() {
                        self.flags.stall_local(
                            parent_path.join(&local_name),
                            SyncWaitReason::MoveConflict,
                        );
                        ctx.moves_complete = false;
                        return true;
                    }
                    debug!(
                        sync = %self.config.name,
                        handle = %cloud.handle,
                        "cloud move detected, propagating locally"
                    );
                    let from = self.mirror.full_path(source);
                    let to = parent_path.join(&local_name);
                    out.actions.push(SyncAction::LocalRename {
                        from,
                        to,
                        mirror: source,
                    });
                    // The cloud already holds the new name/parent: update
                    // the tree silently.
                    let old_parent = self.mirror.node(source).and_then(|n| n.parent);
                    let _ = self.mirror.set_parent_and_name(
                        source,
                        parent_id,
                        &local_name,
                        None,
                        false,
                    );
                    self.statecache_add(source);
                    self.mirror
                        .set_tree_state(source, TreeState::Pending, &mut out.tree_events);
                    if let Some(old_parent) = old_parent {
                        self.mirror.mark_needs_rescan(old_parent);
                    }
                    self.mirror.mark_needs_rescan(parent_id);
                    ctx.progressed = true;
                    return true;
                }
            }
        }

        false
    }

    /// Emits cloud ops as actions and applies them to the snapshot right
    /// away: later rows in this tick must see the post-move cloud shape.
    /// The driver's completion callbacks re-apply them idempotently.
    fn push_cloud_ops(&mut self, ops: Vec<CloudOp>, out: &mut TickOutput) {
        for op in ops {
            match op {
                CloudOp::Rename { handle, new_name } => {
                    self.cloud.apply_rename(handle, &new_name);
                    out.actions
                        .push(SyncAction::CloudRename { handle, new_name });
                }
                CloudOp::Move { handle, new_parent } => {
                    self.cloud.apply_move(handle, new_parent);
                    out.actions
                        .push(SyncAction::CloudMove { handle, new_parent });
                }
            }
        }
    }

    // ==================================================================
    // Row dispatch
    // ==================================================================

    /// Routes one triplet to its resolver. Returns the recursion target for
    /// folder rows that should descend.
    fn sync_item(
        &mut self,
        row: SyncRow,
        parent_id: MirrorId,
        parent_cloud: Option<NodeHandle>,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        match (row.cloud, row.mirror, row.fs) {
            (None, None, None) => None,

            (None, None, Some(fs)) => self.resolve_make_sync_node_from_fs(
                fs,
                parent_id,
                parent_cloud,
                parent_path,
                None,
                ctx,
                out,
            ),

            (Some(cloud), None, None) => {
                if self.is_backup() {
                    // Any remote-side creation faults a backup.
                    out.backup_violation = true;
                    return None;
                }
                self.resolve_make_sync_node_from_cloud(cloud, parent_id, parent_path, ctx, out)
            }

            (None, Some(mirror), None) => {
                self.resolve_del_sync_node(mirror, ctx, out);
                None
            }

            (Some(cloud), Some(mirror), None) => {
                self.resolve_row_fs_gone(cloud, mirror, parent_path, ctx, out)
            }

            (None, Some(mirror), Some(fs)) => {
                self.resolve_row_cloud_gone(mirror, fs, parent_id, parent_cloud, parent_path, ctx, out)
            }

            (Some(cloud), None, Some(fs)) => {
                self.resolve_claim_binding(cloud, fs, parent_id, parent_cloud, parent_path, ctx, out)
            }

            (Some(cloud), Some(mirror), Some(fs)) => {
                self.resolve_full_row(cloud, mirror, fs, parent_path, ctx, out)
            }
        }
    }

    // ==================================================================
    // Resolvers
    // ==================================================================

    /// `(-, -, F)`: a new local entity; mirror it and propagate up.
    #[allow(clippy::too_many_arguments)]
    fn resolve_make_sync_node_from_fs(
        &mut self,
        fs: FsEntry,
        parent_id: MirrorId,
        parent_cloud: Option<NodeHandle>,
        parent_path: &Path,
        considered_synced_with: Option<CloudNode>,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        let claiming = considered_synced_with.is_some();
        if !claiming && !self.flags.moves_were_complete {
            ctx.deferred = true;
            return None;
        }

        let id = self
            .mirror
            .add_child(parent_id, fs.kind, &fs.name, fs.short_name.clone());
        self.mirror.set_fsid(id, fs.fsid);
        let child_path = parent_path.join(&fs.name);

        if let Some(cloud) = considered_synced_with {
            // Existing cloud counterpart with equal content: claim the
            // binding instead of re-transferring.
            self.mirror.bind_cloud(id, cloud.handle);
            if fs.kind == NodeKind::File {
                if let Some(node) = self.mirror.node_mut(id) {
                    node.fingerprint = fs.fingerprint;
                }
            }
            self.statecache_add(id);
            self.mirror
                .set_tree_state(id, TreeState::Synced, &mut out.tree_events);
            ctx.progressed = true;
            let handle = cloud.handle;
            return (fs.kind == NodeKind::Folder).then_some((id, Some(handle), child_path));
        }

        self.statecache_add(id);
        ctx.progressed = true;

        match fs.kind {
            NodeKind::Folder => {
                if !self.config.direction.allows_up() {
                    // Down-only syncs still mirror local folders so their
                    // contents can be reconciled, but create nothing remote.
                    self.mirror
                        .set_tree_state(id, TreeState::Pending, &mut out.tree_events);
                    return Some((id, None, child_path));
                }
                if let Some(parent_handle) = parent_cloud {
                    self.pending_ops.insert(id);
                    out.actions.push(SyncAction::CloudCreate {
                        parent: parent_handle,
                        kind: NodeKind::Folder,
                        name: normalize_nfc(&unescape_name(&fs.name, self.fs_kind)),
                        mirror: id,
                    });
                } else {
                    ctx.deferred = true;
                }
                self.mirror
                    .set_tree_state(id, TreeState::Pending, &mut out.tree_events);
                Some((id, None, child_path))
            }
            NodeKind::File => {
                self.mirror
                    .set_tree_state(id, TreeState::Pending, &mut out.tree_events);
                self.maybe_start_upload(id, &fs, parent_cloud, &child_path, ctx, out);
                None
            }
        }
    }

    /// `(C, -, -)`: a new cloud entity; mirror it and propagate down.
    fn resolve_make_sync_node_from_cloud(
        &mut self,
        cloud: CloudNode,
        parent_id: MirrorId,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        if !self.config.direction.allows_down() {
            // Up-only: remote-only entities are left alone.
            return None;
        }
        if !self.flags.moves_were_complete {
            ctx.deferred = true;
            return None;
        }
        if !cloud.key_applied {
            // Content key not available yet; try again later.
            ctx.deferred = true;
            return None;
        }

        let local_name = escape_name(&cloud.name, self.fs_kind);
        let id = self
            .mirror
            .add_child(parent_id, cloud.kind, &local_name, None);
        self.mirror.bind_cloud(id, cloud.handle);
        self.statecache_add(id);
        let child_path = parent_path.join(&local_name);
        ctx.progressed = true;

        match cloud.kind {
            NodeKind::Folder => {
                self.pending_ops.insert(id);
                out.actions.push(SyncAction::LocalMkDir {
                    path: child_path,
                    mirror: id,
                });
                self.mirror
                    .set_tree_state(id, TreeState::Pending, &mut out.tree_events);
                // Recursion starts next tick, once the directory exists.
                None
            }
            NodeKind::File => {
                self.pending_ops.insert(id);
                out.actions.push(SyncAction::StartDownload {
                    handle: cloud.handle,
                    path: child_path,
                    mirror: id,
                });
                self.mirror
                    .set_tree_state(id, TreeState::Syncing, &mut out.tree_events);
                None
            }
        }
    }

    /// `(-, M, -)`: the entity vanished on both sides.
    fn resolve_del_sync_node(&mut self, mirror: MirrorId, ctx: &mut TickCtx, out: &mut TickOutput) {
        debug!(
            sync = %self.config.name,
            path = %self.mirror.full_path(mirror).display(),
            "mirror node gone on both sides"
        );
        self.remove_mirror_subtree(mirror, out);
        ctx.progressed = true;
    }

    /// `(C, M, -)`: the local entity is gone.
    fn resolve_row_fs_gone(
        &mut self,
        cloud: CloudNode,
        mirror: MirrorId,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        let cloud_unchanged = self.sync_equal_cloud_mirror(&cloud, mirror);

        if self.is_backup() && !cloud_unchanged {
            out.backup_violation = true;
            return None;
        }
        if !self.flags.moves_were_complete {
            // The entry may be mid-move; wait for the move phase.
            ctx.deferred = true;
            return None;
        }

        if cloud_unchanged && self.config.direction.allows_up() {
            // The only change is the local deletion: propagate it. The
            // cloud entity goes to debris, recoverable.
            debug!(
                sync = %self.config.name,
                handle = %cloud.handle,
                "local deletion, moving cloud node to debris"
            );
            out.actions.push(SyncAction::CloudDebris {
                handle: cloud.handle,
            });
            self.remove_mirror_subtree(mirror, out);
            ctx.progressed = true;
            return None;
        }

        if self.config.direction.allows_down() {
            // Down-only syncs undo local deletions; two-way syncs re-create
            // the local side when the remote also changed (the edit wins
            // over the stale deletion).
            return self.resolve_downsync(cloud, mirror, parent_path, ctx, out);
        }

        // Up-only with a remote change: local remains the source of truth.
        out.actions.push(SyncAction::CloudDebris {
            handle: cloud.handle,
        });
        self.remove_mirror_subtree(mirror, out);
        ctx.progressed = true;
        None
    }

    /// Re-creates the local side of `(C, M, -)`.
    fn resolve_downsync(
        &mut self,
        cloud: CloudNode,
        mirror: MirrorId,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        if self.pending_ops.contains(&mirror) {
            ctx.deferred = true;
            return None;
        }
        let local_name = escape_name(&cloud.name, self.fs_kind);
        let child_path = parent_path.join(&local_name);
        ctx.progressed = true;
        self.pending_ops.insert(mirror);
        match cloud.kind {
            NodeKind::Folder => {
                out.actions.push(SyncAction::LocalMkDir {
                    path: child_path,
                    mirror,
                });
            }
            NodeKind::File => {
                out.actions.push(SyncAction::StartDownload {
                    handle: cloud.handle,
                    path: child_path,
                    mirror,
                });
            }
        }
        self.mirror
            .set_tree_state(mirror, TreeState::Syncing, &mut out.tree_events);
        None
    }

    /// `(-, M, F)`: the cloud entity is gone (or never created yet).
    #[allow(clippy::too_many_arguments)]
    fn resolve_row_cloud_gone(
        &mut self,
        mirror: MirrorId,
        fs: FsEntry,
        parent_id: MirrorId,
        parent_cloud: Option<NodeHandle>,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        let was_bound = self.mirror.node(mirror).and_then(|n| n.cloud_handle).is_some();

        if !was_bound {
            // Never uploaded: continue the up-sync.
            return self.resolve_upsync(mirror, fs, parent_cloud, parent_path, ctx, out);
        }

        // Bound but the cloud node no longer exists: a remote deletion.
        if self.is_backup() {
            out.backup_violation = true;
            return None;
        }
        if !self.flags.moves_were_complete {
            ctx.deferred = true;
            return None;
        }

        let fs_unchanged = self.sync_equal_fs_mirror(&fs, mirror);
        if fs_unchanged && self.config.direction.allows_down() {
            // The only change is the remote deletion: propagate it. The
            // local entity goes to debris, recoverable.
            let path = self.mirror.full_path(mirror);
            debug!(sync = %self.config.name, path = %path.display(), "remote deletion, staging local debris");
            out.actions.push(SyncAction::LocalDebris { path });
            self.remove_mirror_subtree(mirror, out);
            // The parent's cached listing still names the entry.
            self.mirror.mark_needs_rescan(parent_id);
            ctx.progressed = true;
            return None;
        }

        if self.config.direction.allows_up() {
            // Up-only syncs undo remote deletions; two-way syncs re-upload
            // when the local side also changed (the edit wins over the
            // stale deletion).
            self.mirror.unbind_cloud(mirror);
            return self.resolve_upsync(mirror, fs, parent_cloud, parent_path, ctx, out);
        }

        // Down-only with local edits: the remote deletion still wins.
        let path = self.mirror.full_path(mirror);
        out.actions.push(SyncAction::LocalDebris { path });
        self.remove_mirror_subtree(mirror, out);
        self.mirror.mark_needs_rescan(parent_id);
        ctx.progressed = true;
        None
    }

    /// Pushes the local version of `(-, M, F)` up to the cloud.
    fn resolve_upsync(
        &mut self,
        mirror: MirrorId,
        fs: FsEntry,
        parent_cloud: Option<NodeHandle>,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        self.mirror.set_fsid(mirror, fs.fsid);
        let child_path = parent_path.join(&fs.name);
        let bound = self.mirror.node(mirror).and_then(|n| n.cloud_handle);

        match fs.kind {
            NodeKind::Folder => {
                if bound.is_none()
                    && !self.pending_ops.contains(&mirror)
                    && self.config.direction.allows_up()
                    && self.flags.moves_were_complete
                {
                    if let Some(parent_handle) = parent_cloud {
                        self.pending_ops.insert(mirror);
                        out.actions.push(SyncAction::CloudCreate {
                            parent: parent_handle,
                            kind: NodeKind::Folder,
                            name: normalize_nfc(&unescape_name(&fs.name, self.fs_kind)),
                            mirror,
                        });
                        self.mirror
                            .set_tree_state(mirror, TreeState::Pending, &mut out.tree_events);
                        ctx.progressed = true;
                    } else {
                        ctx.deferred = true;
                    }
                } else if bound.is_none() {
                    ctx.deferred = true;
                }
                Some((mirror, bound, child_path))
            }
            NodeKind::File => {
                if self.pending_ops.contains(&mirror) {
                    ctx.deferred = true;
                    return None;
                }
                if !self.flags.moves_were_complete {
                    ctx.deferred = true;
                    return None;
                }
                self.maybe_start_upload(mirror, &fs, parent_cloud, &child_path, ctx, out);
                None
            }
        }
    }

    /// `(C, -, F)`: both sides exist but were never reconciled.
    #[allow(clippy::too_many_arguments)]
    fn resolve_claim_binding(
        &mut self,
        cloud: CloudNode,
        fs: FsEntry,
        parent_id: MirrorId,
        parent_cloud: Option<NodeHandle>,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        if cloud.kind != fs.kind {
            self.user_intervention(parent_path, &fs.name, SyncWaitReason::BothChangedIncompatibly);
            return None;
        }

        let equal = match (cloud.kind, cloud.fingerprint, fs.fingerprint) {
            (NodeKind::Folder, _, _) => true,
            (NodeKind::File, Some(c), Some(f)) => c.content_eq(&f),
            _ => false,
        };

        if equal {
            self.resolve_make_sync_node_from_fs(
                fs,
                parent_id,
                parent_cloud,
                parent_path,
                Some(cloud),
                ctx,
                out,
            )
        } else {
            self.user_intervention(parent_path, &fs.name, SyncWaitReason::BothChangedIncompatibly);
            None
        }
    }

    /// `(C, M, F)`: the fully populated row.
    fn resolve_full_row(
        &mut self,
        cloud: CloudNode,
        mirror: MirrorId,
        fs: FsEntry,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) -> Recurse {
        if cloud.kind != fs.kind {
            if self.is_backup() {
                out.backup_violation = true;
                return None;
            }
            self.user_intervention(parent_path, &fs.name, SyncWaitReason::BothChangedIncompatibly);
            return None;
        }

        // Keep the binding and the fsid index current.
        if self.mirror.node(mirror).and_then(|n| n.cloud_handle) != Some(cloud.handle) {
            self.mirror.bind_cloud(mirror, cloud.handle);
            self.statecache_add(mirror);
        }
        if self.mirror.node(mirror).and_then(|n| n.fsid) != Some(fs.fsid) {
            self.mirror.set_fsid(mirror, fs.fsid);
            self.statecache_add(mirror);
        }
        if let Some(node) = self.mirror.node_mut(mirror) {
            node.checked = true;
        }

        let child_path = parent_path.join(&fs.name);

        if cloud.kind == NodeKind::Folder {
            return Some((mirror, Some(cloud.handle), child_path));
        }

        // Files: compare both sides against the reconciled version.
        if self.pending_ops.contains(&mirror) {
            ctx.deferred = true;
            return None;
        }

        let mirror_fp = self.mirror.node(mirror).and_then(|n| n.fingerprint);
        let Some(mirror_fp) = mirror_fp else {
            // No reconciled version to compare against: behave like a claim.
            let equal = matches!(
                (cloud.fingerprint, fs.fingerprint),
                (Some(c), Some(f)) if c.content_eq(&f)
            );
            if equal {
                if let Some(node) = self.mirror.node_mut(mirror) {
                    node.fingerprint = fs.fingerprint;
                }
                self.statecache_add(mirror);
                self.mirror
                    .set_tree_state(mirror, TreeState::Synced, &mut out.tree_events);
                ctx.progressed = true;
            } else {
                self.user_intervention(
                    parent_path,
                    &fs.name,
                    SyncWaitReason::BothChangedIncompatibly,
                );
            }
            return None;
        };

        let cloud_changed = !cloud
            .fingerprint
            .map_or(false, |c| c.content_eq(&mirror_fp));
        let fs_changed = !fs.fingerprint.map_or(false, |f| f.content_eq(&mirror_fp));

        match (cloud_changed, fs_changed) {
            (false, false) => {
                self.mirror
                    .set_tree_state(mirror, TreeState::Synced, &mut out.tree_events);
                None
            }
            (false, true) => {
                // Local edit.
                if self.config.direction.allows_up() {
                    if !self.flags.moves_were_complete {
                        ctx.deferred = true;
                        return None;
                    }
                    let parent_cloud = cloud.parent;
                    self.maybe_start_upload(mirror, &fs, parent_cloud, &child_path, ctx, out);
                } else {
                    self.resolve_downsync(cloud, mirror, parent_path, ctx, out);
                }
                None
            }
            (true, false) => {
                // Remote edit.
                if self.is_backup() {
                    out.backup_violation = true;
                    return None;
                }
                if !self.flags.moves_were_complete {
                    ctx.deferred = true;
                    return None;
                }
                if self.config.direction.allows_down() {
                    self.resolve_downsync(cloud, mirror, parent_path, ctx, out);
                } else {
                    // Up-only: local remains the source of truth.
                    let parent_cloud = cloud.parent;
                    self.maybe_start_upload(mirror, &fs, parent_cloud, &child_path, ctx, out);
                }
                None
            }
            (true, true) => {
                if self.is_backup() {
                    out.backup_violation = true;
                    return None;
                }
                self.resolve_pick_winner(cloud, mirror, fs, parent_path, ctx, out);
                None
            }
        }
    }

    /// Both sides changed a file: the newer mtime wins; ties follow the
    /// configured tie-break.
    fn resolve_pick_winner(
        &mut self,
        cloud: CloudNode,
        mirror: MirrorId,
        fs: FsEntry,
        parent_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) {
        if !self.flags.moves_were_complete {
            ctx.deferred = true;
            return;
        }
        let cloud_mtime = cloud.fingerprint.map(|f| f.mtime).unwrap_or(cloud.mtime);
        let fs_mtime = fs.mtime;
        let child_path = parent_path.join(&fs.name);

        if fs_mtime > cloud_mtime {
            debug!(path = %child_path.display(), "conflict: local version is newer, uploading");
            let parent_cloud = cloud.parent;
            self.maybe_start_upload(mirror, &fs, parent_cloud, &child_path, ctx, out);
        } else if cloud_mtime > fs_mtime {
            debug!(path = %child_path.display(), "conflict: remote version is newer, downloading");
            self.resolve_downsync(cloud, mirror, parent_path, ctx, out);
        } else {
            match self.config.tie_break {
                cirrus_core::domain::TieBreak::PreferLocal => {
                    debug!(path = %child_path.display(), "conflict tie, keeping local version");
                    let parent_cloud = cloud.parent;
                    self.maybe_start_upload(mirror, &fs, parent_cloud, &child_path, ctx, out);
                }
                cirrus_core::domain::TieBreak::Stall => {
                    self.user_intervention(parent_path, &fs.name, SyncWaitReason::BothChangedTie);
                }
            }
        }
    }

    /// Starts (or defers) an upload of `fs` for mirror node `id`.
    fn maybe_start_upload(
        &mut self,
        id: MirrorId,
        fs: &FsEntry,
        parent_cloud: Option<NodeHandle>,
        child_path: &Path,
        ctx: &mut TickCtx,
        out: &mut TickOutput,
    ) {
        if !self.config.direction.allows_up() {
            return;
        }
        if self.pending_ops.contains(&id) {
            ctx.deferred = true;
            return;
        }
        let Some(parent_handle) = parent_cloud else {
            // Parent folder not created in the cloud yet.
            ctx.deferred = true;
            self.mirror
                .set_tree_state(id, TreeState::Pending, &mut out.tree_events);
            return;
        };
        let Some(fingerprint) = fs.fingerprint else {
            ctx.deferred = true;
            return;
        };

        // Nagle: a file modified moments ago may still be written to.
        if ctx.now - fs.mtime < Duration::milliseconds(NAGLE_DELAY_MS) {
            trace!(path = %child_path.display(), "upload delayed by nagle");
            if let Some(node) = self.mirror.node_mut(id) {
                node.nagle_until = Some(fs.mtime + Duration::milliseconds(NAGLE_DELAY_MS));
            }
            out.nagle_pending = true;
            ctx.deferred = true;
            return;
        }

        self.pending_ops.insert(id);
        out.actions.push(SyncAction::StartUpload {
            path: child_path.to_path_buf(),
            parent: parent_handle,
            name: normalize_nfc(&unescape_name(&fs.name, self.fs_kind)),
            fingerprint,
            mirror: id,
        });
        self.mirror
            .set_tree_state(id, TreeState::Syncing, &mut out.tree_events);
        ctx.progressed = true;
    }

    fn user_intervention(&mut self, parent_path: &Path, name: &str, reason: SyncWaitReason) {
        let local = parent_path.join(name);
        let node_path = self.cloud_path_of(parent_path, name);
        warn!(path = %local.display(), ?reason, "row needs user intervention");
        self.flags.stall_node(node_path, reason);
        self.flags.stall_local(local, reason);
    }

    // ==================================================================
    // Equality predicates
    // ==================================================================

    fn sync_equal_cloud_mirror(&self, cloud: &CloudNode, mirror: MirrorId) -> bool {
        let Some(node) = self.mirror.node(mirror) else {
            return false;
        };
        if cloud.kind != node.kind {
            return false;
        }
        match cloud.kind {
            NodeKind::Folder => true,
            NodeKind::File => matches!(
                (cloud.fingerprint, node.fingerprint),
                (Some(c), Some(m)) if c.content_eq(&m)
            ),
        }
    }

    fn sync_equal_fs_mirror(&self, fs: &FsEntry, mirror: MirrorId) -> bool {
        let Some(node) = self.mirror.node(mirror) else {
            return false;
        };
        if fs.kind != node.kind {
            return false;
        }
        match fs.kind {
            NodeKind::Folder => true,
            NodeKind::File => matches!(
                (fs.fingerprint, node.fingerprint),
                (Some(f), Some(m)) if f.content_eq(&m)
            ),
        }
    }

    // ==================================================================
    // State cache queues
    // ==================================================================

    /// Queues a node for (re-)insertion into the state cache.
    pub fn statecache_add(&mut self, id: MirrorId) {
        let row = self.mirror.ensure_row_id(id);
        self.deleteq.remove(&row);
        self.insertq.insert(id);
    }

    /// Removes a mirror subtree, queueing its rows for deletion and
    /// cancelling transfers it owned.
    fn remove_mirror_subtree(&mut self, id: MirrorId, out: &mut TickOutput) {
        let removed = self.mirror.remove_subtree(id);
        for (removed_id, row) in &removed {
            self.insertq.remove(removed_id);
            self.pending_ops.remove(removed_id);
            self.scan_requests.remove(removed_id);
            self.scan_results.remove(removed_id);
            if let Some(row) = row {
                self.deleteq.insert(*row);
            }
            let owned: Vec<TransferId> = self
                .in_flight
                .iter()
                .filter(|(_, m)| *m == removed_id)
                .map(|(t, _)| *t)
                .collect();
            for transfer in owned {
                self.in_flight.remove(&transfer);
                out.actions.push(SyncAction::CancelTransfer { id: transfer });
            }
        }
    }

    /// Drains the insert/delete queues for the tick's transaction. Inserts
    /// come out parents-first.
    pub fn take_cache_ops(&mut self) -> (Vec<MirrorRow>, Vec<i64>) {
        let mut ids: Vec<MirrorId> = self.insertq.drain().collect();
        ids.sort_by_key(|id| (self.mirror.depth(*id), id.0));

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            // The parent must have a row id before the child row serializes.
            if let Some(parent) = self.mirror.node(id).and_then(|n| n.parent) {
                self.mirror.ensure_row_id(parent);
            }
            self.mirror.ensure_row_id(id);
            if let Some(row) = self.mirror.to_row(id) {
                rows.push(row);
            }
        }
        let deletes: Vec<i64> = self.deleteq.drain().collect();
        (rows, deletes)
    }

    /// Test/diagnostic view of the queues.
    #[must_use]
    pub fn cache_queues(&self) -> (usize, usize) {
        (self.insertq.len(), self.deleteq.len())
    }

    // ==================================================================
    // Driver feedback
    // ==================================================================

    /// A `FetchCloudChildren` action completed.
    pub fn note_children_fetched(&mut self, handle: NodeHandle, children: Vec<CloudNode>) {
        self.pending_fetches.remove(&handle);
        self.cloud.set_children(handle, children);
    }

    /// A `FetchCloudChildren` action failed; it will be re-issued.
    pub fn note_fetch_failed(&mut self, handle: NodeHandle) {
        self.pending_fetches.remove(&handle);
    }

    /// A `CloudCreate` action completed.
    pub fn note_cloud_created(&mut self, mirror: MirrorId, handle: NodeHandle, out_events: &mut Vec<crate::mirror::TreeStateEvent>) {
        self.pending_ops.remove(&mirror);
        let Some(node) = self.mirror.node(mirror) else {
            return;
        };
        let name = normalize_nfc(&unescape_name(&node.leaf_name, self.fs_kind));
        let parent_handle = node
            .parent
            .and_then(|p| self.mirror.node(p))
            .and_then(|p| p.cloud_handle);
        self.mirror.bind_cloud(mirror, handle);
        self.statecache_add(mirror);
        self.cloud
            .upsert(CloudNode::folder(handle, parent_handle, name));
        // A fresh folder has no children; mark the set as known.
        self.cloud.set_children(handle, Vec::new());
        self.mirror
            .set_tree_state(mirror, TreeState::Pending, out_events);
    }

    /// A `LocalMkDir` action completed; `fsid` is the new directory's id.
    pub fn note_local_dir_created(&mut self, mirror: MirrorId, fsid: Fsid, out_events: &mut Vec<crate::mirror::TreeStateEvent>) {
        self.pending_ops.remove(&mirror);
        self.mirror.set_fsid(mirror, fsid);
        self.statecache_add(mirror);
        self.mirror.mark_needs_rescan(mirror);
        // The parent's cached listing predates the new directory.
        if let Some(parent) = self.mirror.node(mirror).and_then(|n| n.parent) {
            self.mirror.mark_needs_rescan(parent);
        }
        self.mirror
            .set_tree_state(mirror, TreeState::Pending, out_events);
    }

    /// An upload was accepted by the transfer engine.
    pub fn note_upload_started(&mut self, mirror: MirrorId, id: TransferId) {
        self.in_flight.insert(id, mirror);
    }

    /// A download was accepted by the transfer engine.
    pub fn note_download_started(&mut self, mirror: MirrorId, id: TransferId) {
        self.in_flight.insert(id, mirror);
    }

    /// An upload completed: `handle` is the new cloud file node.
    pub fn note_upload_completed(
        &mut self,
        id: TransferId,
        handle: NodeHandle,
        fingerprint: FileFingerprint,
        out_events: &mut Vec<crate::mirror::TreeStateEvent>,
    ) {
        let Some(mirror) = self.in_flight.remove(&id) else {
            return;
        };
        self.pending_ops.remove(&mirror);
        let Some(node) = self.mirror.node(mirror) else {
            return;
        };
        let name = normalize_nfc(&unescape_name(&node.leaf_name, self.fs_kind));
        let parent_handle = node
            .parent
            .and_then(|p| self.mirror.node(p))
            .and_then(|p| p.cloud_handle);
        self.mirror.bind_cloud(mirror, handle);
        if let Some(node) = self.mirror.node_mut(mirror) {
            node.fingerprint = Some(fingerprint);
        }
        self.statecache_add(mirror);
        if let Some(parent_handle) = parent_handle {
            self.cloud
                .upsert(CloudNode::file(handle, parent_handle, name, fingerprint));
        }
        self.mirror
            .set_tree_state(mirror, TreeState::Synced, out_events);
    }

    /// A download completed; the file is in place on disk.
    pub fn note_download_completed(
        &mut self,
        id: TransferId,
        out_events: &mut Vec<crate::mirror::TreeStateEvent>,
    ) {
        let Some(mirror) = self.in_flight.remove(&id) else {
            return;
        };
        self.pending_ops.remove(&mirror);
        let path = self.mirror.full_path(mirror);
        if let Ok(st) = cirrus_fs::stat(&path) {
            self.mirror.set_fsid(mirror, st.fsid);
        }
        if let Ok(fingerprint) = FileFingerprint::of_file(&path) {
            if let Some(node) = self.mirror.node_mut(mirror) {
                node.fingerprint = Some(fingerprint);
            }
        }
        self.statecache_add(mirror);
        // Refresh the parent's snapshot so the new entry is visible.
        if let Some(parent) = self.mirror.node(mirror).and_then(|n| n.parent) {
            self.mirror.mark_needs_rescan(parent);
        }
        self.mirror
            .set_tree_state(mirror, TreeState::Synced, out_events);
    }

    /// A transfer failed terminally; the row will be retried after rescan.
    pub fn note_transfer_terminated(&mut self, id: TransferId, reason: &str) {
        if let Some(mirror) = self.in_flight.remove(&id) {
            warn!(sync = %self.config.name, %reason, "transfer terminated");
            self.pending_ops.remove(&mirror);
            if let Some(parent) = self.mirror.node(mirror).and_then(|n| n.parent) {
                self.mirror.mark_needs_rescan(parent);
            }
            self.notifier.push(cirrus_fs::Notification {
                relative_path: self
                    .mirror
                    .full_path(mirror)
                    .strip_prefix(&self.config.local_path)
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
                timestamp: Utc::now(),
                queue: NotifyQueue::Retry,
                deep: false,
            });
        }
    }

    /// A cloud rename completed on the wire.
    pub fn note_cloud_renamed(&mut self, handle: NodeHandle, new_name: &str) {
        self.cloud.apply_rename(handle, new_name);
    }

    /// A cloud move completed on the wire.
    pub fn note_cloud_moved(&mut self, handle: NodeHandle, new_parent: NodeHandle) {
        self.cloud.apply_move(handle, new_parent);
    }

    /// A cloud node landed in the server-side debris.
    pub fn note_cloud_debris_done(&mut self, handle: NodeHandle) {
        self.cloud.remove_subtree(handle);
    }

    /// The client learned of server-side changes below `handle`; the
    /// snapshot refetches on the next tick and the rows re-evaluate.
    pub fn note_remote_changed(&mut self, handle: NodeHandle) {
        self.cloud.invalidate(handle);
    }

    /// A local rename (cloud-move propagation) completed.
    pub fn note_local_renamed(&mut self, mirror: MirrorId, out_events: &mut Vec<crate::mirror::TreeStateEvent>) {
        let path = self.mirror.full_path(mirror);
        if let Ok(st) = cirrus_fs::stat(&path) {
            self.mirror.set_fsid(mirror, st.fsid);
        }
        self.statecache_add(mirror);
        self.mirror
            .set_tree_state(mirror, TreeState::Synced, out_events);
    }

    /// A `LocalDebris` action completed.
    pub fn note_local_debris_done(&mut self, _path: &Path) {}

    /// Generic action failure: queue a retry for the affected path.
    pub fn note_action_failed(&mut self, local_path: &Path, reason: &str) {
        warn!(sync = %self.config.name, path = %local_path.display(), %reason, "action failed, queueing retry");
        let relative = local_path
            .strip_prefix(&self.config.local_path)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let covering = self.mirror.node_covering(&relative);
        self.mirror.mark_needs_rescan(covering);
        self.notifier.push(cirrus_fs::Notification {
            relative_path: relative,
            timestamp: Utc::now(),
            queue: NotifyQueue::Retry,
            deep: false,
        });
    }

    /// Local debris handle, if available.
    #[must_use]
    pub fn local_debris(&self) -> Option<&LocalDebris> {
        self.debris.as_ref()
    }

    /// Prepares the sync for teardown: no further tree-state reporting or
    /// debris staging.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        self.mirror.shutting_down = true;
        self.scan_requests.clear();
        self.insertq.clear();
        self.deleteq.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::domain::{BackupId, SyncDirection};
    use cirrus_fs::NoopNotifier;

    fn test_sync(direction: SyncDirection) -> (tempfile::TempDir, Sync) {
        let tmp = tempfile::tempdir().unwrap();
        let config = SyncConfig::new(
            BackupId::new(1),
            tmp.path().to_path_buf(),
            "test".into(),
            NodeHandle::new(1),
            "/remote".into(),
            direction,
        );
        let root_cloud = CloudNode::folder(NodeHandle::new(1), None, "remote");
        let sync = Sync::new(config, Box::new(NoopNotifier::new()), root_cloud);
        (tmp, sync)
    }

    #[test]
    fn cache_queues_stay_disjoint() {
        let (_tmp, mut sync) = test_sync(SyncDirection::TwoWay);
        let root = sync.mirror.root();
        let child = sync.mirror.add_child(root, NodeKind::File, "f.txt", None);

        sync.statecache_add(child);
        sync.statecache_add(child);
        let (inserts, _) = sync.cache_queues();
        // Root (from construction) + the child, each once.
        assert_eq!(inserts, 2);

        let mut out = TickOutput::default();
        sync.remove_mirror_subtree(child, &mut out);
        let (inserts, deletes) = sync.cache_queues();
        assert_eq!(inserts, 1);
        // The child never reached the cache: its row id is only queued for
        // deletion, and re-adding it is impossible (node gone).
        assert_eq!(deletes, 1);
    }

    #[test]
    fn churned_node_costs_at_most_one_write() {
        let (_tmp, mut sync) = test_sync(SyncDirection::TwoWay);
        let root = sync.mirror.root();
        let child = sync.mirror.add_child(root, NodeKind::File, "f.txt", None);
        sync.statecache_add(child);
        let row = sync.mirror.node(child).unwrap().row_id.unwrap();

        let mut out = TickOutput::default();
        sync.remove_mirror_subtree(child, &mut out);
        // Re-create under the same name; gets a fresh row.
        let again = sync.mirror.add_child(root, NodeKind::File, "f.txt", None);
        sync.statecache_add(again);

        let (rows, deletes) = sync.take_cache_ops();
        assert!(deletes.contains(&row));
        assert!(rows.iter().all(|r| r.row_id != row));
        assert!(!rows.iter().any(|r| deletes.contains(&r.row_id)));
    }

    #[test]
    fn take_cache_ops_orders_parents_first() {
        let (_tmp, mut sync) = test_sync(SyncDirection::TwoWay);
        let root = sync.mirror.root();
        let a = sync.mirror.add_child(root, NodeKind::Folder, "a", None);
        let b = sync.mirror.add_child(a, NodeKind::Folder, "b", None);
        let c = sync.mirror.add_child(b, NodeKind::File, "c.txt", None);

        // Queue in child-first order on purpose.
        sync.statecache_add(c);
        sync.statecache_add(b);
        sync.statecache_add(a);

        let (rows, _) = sync.take_cache_ops();
        for (index, row) in rows.iter().enumerate() {
            if let Some(parent_row) = row.parent_row {
                let parent_pos = rows.iter().position(|r| r.row_id == parent_row);
                if let Some(parent_pos) = parent_pos {
                    assert!(parent_pos < index, "parent row serialized after child");
                }
            }
        }
    }

    #[test]
    fn disabled_sync_ticks_quietly() {
        let (_tmp, mut sync) = test_sync(SyncDirection::TwoWay);
        sync.state = SyncState::Disabled;
        let scan = ScanService::new(cirrus_core::ports::Waiter::new());
        let out = sync.tick(&scan, Utc::now());
        assert!(out.is_quiet());
    }

    #[test]
    fn failed_action_queues_a_retry_notification() {
        let (tmp, mut sync) = test_sync(SyncDirection::TwoWay);
        let path = tmp.path().join("sub/f.txt");
        assert_eq!(sync.notifier.pending(), 0);
        sync.note_action_failed(&path, "simulated failure");
        assert_eq!(sync.notifier.pending(), 1);
        assert!(sync
            .notifier
            .pop(NotifyQueue::Retry)
            .map(|n| n.relative_path == Path::new("sub/f.txt"))
            .unwrap_or(false));
    }

    #[test]
    fn backup_sync_reports_remote_create_as_violation() {
        let (_tmp, mut sync) = test_sync(SyncDirection::Backup);
        let root = sync.mirror.root();
        let root_path = sync.mirror.full_path(root);
        let intruder = CloudNode::file(
            NodeHandle::new(99),
            NodeHandle::new(1),
            "intruder.txt",
            FileFingerprint::new(1, Utc::now(), 42),
        );

        let mut ctx = TickCtx {
            now: Utc::now(),
            scanning_complete: true,
            moves_complete: true,
            progressed: false,
            deferred: false,
        };
        let mut out = TickOutput::default();
        let row = SyncRow {
            cloud: Some(intruder),
            ..Default::default()
        };
        sync.sync_item(row, root, Some(NodeHandle::new(1)), &root_path, &mut ctx, &mut out);
        assert!(out.backup_violation);
        assert!(out.actions.is_empty());
    }
}
