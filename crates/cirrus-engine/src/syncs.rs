//! The sync container
//!
//! `Syncs` owns every configured sync of the client: the per-drive config
//! store, the running `Sync` instances with their state caches, and the
//! driver loop that executes each tick's actions through the ports. It is
//! also where app notifications are de-duplicated: config changes fire
//! exactly once per change, stall and conflict flags fire on transitions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cirrus_core::domain::{BackupId, SyncConfig, SyncError};
use cirrus_core::ports::{AppEventSink, CloudClient, TransferEngine, TransferEvent, Waiter};
use cirrus_fs::debris::DEBRIS_DIR_NAME;
use cirrus_fs::{DirNotifier, NoopNotifier, NotifyBackend};
use cirrus_scan::ScanService;
use cirrus_store::{StateCache, StoreError, SyncConfigIoContext, SyncConfigStore};

use crate::actions::SyncAction;
use crate::flags::SyncWaitReason;
use crate::mirror::TreeStateEvent;
use crate::sync::{Sync, SyncState};

// ============================================================================
// Result codes and records
// ============================================================================

/// Result codes of the drive-level operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    Args,
    Failed,
    Internal,
    Noent,
    Write,
}

/// Progress summary of one sync, refreshed every tick.
#[derive(Debug, Clone)]
pub struct HeartbeatStatus {
    pub backup_id: BackupId,
    pub state: SyncState,
    pub pending_scans: usize,
    pub in_flight_transfers: usize,
    pub stalled: bool,
    pub last_activity: DateTime<Utc>,
}

/// One configured sync: the config always, the running engine when enabled.
pub struct UnifiedSync {
    pub config: SyncConfig,
    pub sync: Option<Sync>,
    pub heartbeat: Option<HeartbeatStatus>,
}

// ============================================================================
// Syncs
// ============================================================================

/// Container and driver for every sync of one client session.
pub struct Syncs {
    client_db_path: PathBuf,
    store: SyncConfigStore,
    syncs: Vec<UnifiedSync>,
    caches: HashMap<BackupId, StateCache>,

    cloud: Arc<dyn CloudClient>,
    transfers: Arc<dyn TransferEngine>,
    app: Arc<dyn AppEventSink>,
    waiter: Waiter,
    scan: ScanService,

    stalled_reported: bool,
    conflicts_reported: bool,
}

impl Syncs {
    pub fn new(
        client_db_path: PathBuf,
        io: SyncConfigIoContext,
        cloud: Arc<dyn CloudClient>,
        transfers: Arc<dyn TransferEngine>,
        app: Arc<dyn AppEventSink>,
        waiter: Waiter,
    ) -> Self {
        let store = SyncConfigStore::new(&client_db_path, io);
        let scan = ScanService::new(waiter.clone());
        Self {
            client_db_path,
            store,
            syncs: Vec::new(),
            caches: HashMap::new(),
            cloud,
            transfers,
            app,
            waiter,
            scan,
            stalled_reported: false,
            conflicts_reported: false,
        }
    }

    #[must_use]
    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    #[must_use]
    pub fn num_syncs(&self) -> usize {
        self.syncs.len()
    }

    #[must_use]
    pub fn num_running_syncs(&self) -> usize {
        self.syncs.iter().filter(|e| e.sync.is_some()).count()
    }

    pub fn for_each_running_sync(&self, mut f: impl FnMut(&Sync)) {
        for entry in &self.syncs {
            if let Some(sync) = &entry.sync {
                f(sync);
            }
        }
    }

    #[must_use]
    pub fn running_sync_by_backup_id(&mut self, id: BackupId) -> Option<&mut Sync> {
        self.syncs
            .iter_mut()
            .find(|e| e.config.backup_id == id)
            .and_then(|e| e.sync.as_mut())
    }

    #[must_use]
    pub fn sync_config_by_backup_id(&self, id: BackupId) -> Option<&SyncConfig> {
        self.syncs
            .iter()
            .find(|e| e.config.backup_id == id)
            .map(|e| &e.config)
    }

    #[must_use]
    pub fn heartbeats(&self) -> Vec<HeartbeatStatus> {
        self.syncs
            .iter()
            .filter_map(|e| e.heartbeat.clone())
            .collect()
    }

    // ==================================================================
    // Config registration and persistence
    // ==================================================================

    /// Registers a new sync config and persists it to its drive's database.
    pub fn append_new_sync(&mut self, config: SyncConfig) -> Result<(), SyncError> {
        if self
            .syncs
            .iter()
            .any(|e| e.config.backup_id == config.backup_id)
        {
            return Err(SyncError::TooManyChanges);
        }
        if let Some(drive) = &config.external_drive {
            if !config.local_path.starts_with(drive) {
                return Err(SyncError::BackupSourceNotBelowDrive);
            }
        }

        let drive = config_drive(&config);
        self.store.mark_drive_dirty(&drive);
        self.syncs.push(UnifiedSync {
            config,
            sync: None,
            heartbeat: None,
        });
        self.flush_configs();
        Ok(())
    }

    /// Persists an updated config (state/error changes included).
    pub fn save_sync_config(&mut self, config: &SyncConfig) {
        if let Some(entry) = self
            .syncs
            .iter_mut()
            .find(|e| e.config.backup_id == config.backup_id)
        {
            entry.config = config.clone();
            let drive = config_drive(config);
            self.store.mark_drive_dirty(&drive);
            self.flush_configs();
        }
    }

    fn flush_configs(&mut self) {
        let configs: Vec<SyncConfig> = self.syncs.iter().map(|e| e.config.clone()).collect();
        let written = self.store.write_dirty_drives(&configs);
        debug!(drives = written.len(), "sync configs flushed");
    }

    /// Fires `sync_state_config` when (and only when) the entry's error or
    /// enabled flag changed since the app last heard about it.
    fn notify_config_change(app: &Arc<dyn AppEventSink>, entry: &mut UnifiedSync) {
        if entry.config.error_or_enabled_changed() {
            app.sync_state_config(entry.config.backup_id);
        }
    }

    // ==================================================================
    // Enable / disable / remove / unload
    // ==================================================================

    /// Rehydrates and starts a sync from its config and state cache.
    pub async fn enable_sync_by_backup_id(&mut self, id: BackupId) -> Result<(), SyncError> {
        let Some(index) = self.syncs.iter().position(|e| e.config.backup_id == id) else {
            return Err(SyncError::RemoteNodeNotFound);
        };
        if self.syncs[index].sync.is_some() {
            return Ok(());
        }

        let mut config = self.syncs[index].config.clone();

        // The remote root must still resolve.
        let root_cloud = match self.cloud.fetch_node(config.remote_node).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                self.fault_config(index, SyncError::RemoteNodeNotFound);
                return Err(SyncError::RemoteNodeNotFound);
            }
            Err(err) => {
                warn!(error = %err, "cloud unreachable while enabling sync");
                self.fault_config(index, SyncError::NetworkUnavailable);
                return Err(SyncError::NetworkUnavailable);
            }
        };

        // The local root must exist and still be the folder we registered:
        // a relocated root (or swapped drive) must not be mirrored blindly.
        match cirrus_fs::snapshot::volume_fingerprint(&config.local_path) {
            Ok(current) => {
                if config.local_fingerprint.is_unset() {
                    config.local_fingerprint = current;
                } else if config.local_fingerprint != current {
                    warn!(backup_id = %id, "local root fingerprint mismatch");
                    self.fault_config(index, SyncError::LocalPathUnavailable);
                    return Err(SyncError::LocalPathUnavailable);
                }
            }
            Err(_) => {
                self.fault_config(index, SyncError::LocalPathUnavailable);
                return Err(SyncError::LocalPathUnavailable);
            }
        }

        let cache = StateCache::open(&self.client_db_path, id)
            .await
            .map_err(|_| SyncError::StateCacheIOFailure)?;
        let rows = cache
            .load_rows()
            .await
            .map_err(|_| SyncError::StateCacheIOFailure)?;

        let notifier = make_notifier(&config.local_path, &self.waiter);

        config.enabled = true;
        config.error = SyncError::NoSyncError;

        let sync = if rows.is_empty() {
            Sync::new(config.clone(), notifier, root_cloud)
        } else {
            let (sync, report) = Sync::from_rows(config.clone(), notifier, root_cloud, &rows);
            info!(
                backup_id = %id,
                nodes = rows.len(),
                bound = report.bound,
                orphans = report.orphans,
                "state cache loaded"
            );
            sync
        };

        self.caches.insert(id, cache);
        let entry = &mut self.syncs[index];
        entry.config = config;
        entry.sync = Some(sync);
        Self::notify_config_change(&self.app, entry);
        let drive = config_drive(&entry.config);
        self.store.mark_drive_dirty(&drive);
        self.flush_configs();
        self.waiter.notify();
        Ok(())
    }

    fn fault_config(&mut self, index: usize, error: SyncError) {
        let entry = &mut self.syncs[index];
        entry.config.enabled = false;
        entry.config.error = error;
        Self::notify_config_change(&self.app, entry);
        let drive = config_drive(&entry.config);
        self.store.mark_drive_dirty(&drive);
        self.flush_configs();
    }

    /// Stops matching syncs, keeping their configs and state caches.
    pub async fn disable_selected_syncs(
        &mut self,
        selector: impl Fn(&SyncConfig, bool) -> bool,
        error: SyncError,
        new_enabled: bool,
    ) {
        for index in 0..self.syncs.len() {
            let running = self.syncs[index].sync.is_some();
            if !selector(&self.syncs[index].config, running) {
                continue;
            }
            self.stop_sync_at(index).await;
            let entry = &mut self.syncs[index];
            entry.config.enabled = new_enabled;
            entry.config.error = error;
            Self::notify_config_change(&self.app, entry);
            let drive = config_drive(&entry.config);
            self.store.mark_drive_dirty(&drive);
        }
        self.flush_configs();
    }

    /// Removes matching syncs entirely: config unregistered, state cache
    /// deleted.
    pub async fn remove_selected_syncs(&mut self, selector: impl Fn(&SyncConfig, bool) -> bool) {
        let mut index = 0;
        while index < self.syncs.len() {
            let running = self.syncs[index].sync.is_some();
            if !selector(&self.syncs[index].config, running) {
                index += 1;
                continue;
            }
            self.stop_sync_at(index).await;
            let entry = self.syncs.remove(index);
            if let Some(cache) = self.caches.remove(&entry.config.backup_id) {
                if let Err(err) = cache.remove().await {
                    warn!(error = %err, "state cache removal failed");
                }
            } else if let Ok(cache) =
                StateCache::open(&self.client_db_path, entry.config.backup_id).await
            {
                let _ = cache.remove().await;
            }
            let drive = config_drive(&entry.config);
            self.store.mark_drive_dirty(&drive);
        }
        self.flush_configs();
    }

    /// Drops matching syncs from memory, retaining config and state cache.
    pub async fn unload_selected_syncs(&mut self, selector: impl Fn(&SyncConfig, bool) -> bool) {
        for index in 0..self.syncs.len() {
            let running = self.syncs[index].sync.is_some();
            if !selector(&self.syncs[index].config, running) {
                continue;
            }
            self.stop_sync_at(index).await;
        }
    }

    /// Tears one running sync down: cancels its transfers, drops scans, and
    /// commits nothing further.
    async fn stop_sync_at(&mut self, index: usize) {
        let Some(mut sync) = self.syncs[index].sync.take() else {
            return;
        };
        for transfer in sync.in_flight_transfers() {
            if let Err(err) = self.transfers.cancel(transfer).await {
                warn!(error = %err, "transfer cancel failed during sync stop");
            }
        }
        sync.begin_shutdown();
        self.caches.remove(&sync.backup_id());
        self.syncs[index].heartbeat = None;
    }

    // ==================================================================
    // Startup resumption
    // ==================================================================

    /// Loads the internal config database and starts every sync that is
    /// enabled and not faulted, sequentially.
    pub async fn resume_on_startup(&mut self) -> Result<(), StoreError> {
        match self.store.read(Path::new("")) {
            Ok(configs) => {
                for config in configs {
                    if self
                        .syncs
                        .iter()
                        .any(|e| e.config.backup_id == config.backup_id)
                    {
                        continue;
                    }
                    self.syncs.push(UnifiedSync {
                        config,
                        sync: None,
                        heartbeat: None,
                    });
                }
            }
            Err(StoreError::NoDatabase(_)) => {}
            Err(err) => return Err(err),
        }

        let to_start: Vec<BackupId> = self
            .syncs
            .iter()
            .filter(|e| e.config.enabled && !e.config.error.is_error())
            .map(|e| e.config.backup_id)
            .collect();
        for id in to_start {
            if let Err(err) = self.enable_sync_by_backup_id(id).await {
                warn!(backup_id = %id, error = %err, "sync did not resume");
            }
        }
        Ok(())
    }

    // ==================================================================
    // External drive databases
    // ==================================================================

    /// Loads the config database of an external drive and registers its
    /// backups.
    pub async fn backup_open_drive(&mut self, drive: &Path) -> OpResult {
        if !drive.is_absolute() {
            return OpResult::Args;
        }
        match self.store.read(drive) {
            Ok(configs) => {
                for config in configs {
                    if self
                        .syncs
                        .iter()
                        .any(|e| e.config.backup_id == config.backup_id)
                    {
                        continue;
                    }
                    self.syncs.push(UnifiedSync {
                        config,
                        sync: None,
                        heartbeat: None,
                    });
                }
                OpResult::Ok
            }
            Err(StoreError::NoDatabase(_)) => OpResult::Noent,
            Err(StoreError::ReadFailure(_)) => OpResult::Failed,
            Err(_) => OpResult::Internal,
        }
    }

    /// Flushes and forgets an external drive's configs.
    pub async fn backup_close_drive(&mut self, drive: &Path) -> OpResult {
        if !drive.is_absolute() {
            return OpResult::Args;
        }
        if !self.store.drive_known(drive) {
            return OpResult::Noent;
        }
        let on_drive: Vec<BackupId> = self
            .syncs
            .iter()
            .filter(|e| e.config.external_drive.as_deref() == Some(drive))
            .map(|e| e.config.backup_id)
            .collect();
        if self.syncs.iter().any(|e| {
            e.sync.is_some() && e.config.external_drive.as_deref() == Some(drive)
        }) {
            return OpResult::Failed;
        }

        // Flush pending changes for this drive before forgetting it.
        self.store.mark_drive_dirty(drive);
        let configs: Vec<SyncConfig> = self.syncs.iter().map(|e| e.config.clone()).collect();
        let written = self.store.write_dirty_drives(&configs);
        if !written.iter().any(|w| w == drive) {
            return OpResult::Write;
        }

        self.syncs
            .retain(|e| !on_drive.contains(&e.config.backup_id));
        self.store.forget_drive(drive);
        OpResult::Ok
    }

    // ==================================================================
    // The driver loop
    // ==================================================================

    /// Runs one tick for every running sync: transfer completions in,
    /// reconciliation, actions out, state-cache commit, app notifications.
    /// Returns true when any sync still has work pending.
    pub async fn tick_all(&mut self, now: DateTime<Utc>) -> bool {
        self.route_transfer_completions().await;

        let mut any_pending = false;

        for index in 0..self.syncs.len() {
            let entry = &mut self.syncs[index];
            let Some(sync) = entry.sync.as_mut() else {
                continue;
            };

            let mut out = sync.tick(&self.scan, now);
            let backup_id = sync.backup_id();

            let mut events = std::mem::take(&mut out.tree_events);
            execute_actions(
                sync,
                std::mem::take(&mut out.actions),
                &self.cloud,
                &self.transfers,
                &mut events,
            )
            .await;

            // Persist this tick's mirror changes.
            let (inserts, deletes) = sync.take_cache_ops();
            if let Some(cache) = self.caches.get(&backup_id) {
                if let Err(err) = cache.commit(&inserts, &deletes).await {
                    warn!(backup_id = %backup_id, error = %err, "state cache commit failed");
                    sync.state = SyncState::Failed;
                    out.fatal_error = Some(SyncError::StateCacheIOFailure);
                }
            }

            for event in &events {
                self.app
                    .sync_tree_state(backup_id, &event.path, event.state, event.kind);
            }

            entry.heartbeat = Some(HeartbeatStatus {
                backup_id,
                state: sync.state,
                pending_scans: sync.pending_scans(),
                in_flight_transfers: sync.in_flight_transfers().len(),
                stalled: sync.flags.stalled(),
                last_activity: now,
            });

            let new_backup_state = sync.config.backup_state;

            any_pending |= !out.is_quiet();

            if out.config_changed {
                let entry = &mut self.syncs[index];
                entry.config.backup_state = new_backup_state;
                let drive = config_drive(&entry.config);
                self.store.mark_drive_dirty(&drive);
                self.flush_configs();
            }

            if out.backup_violation {
                info!(backup_id = %backup_id, "backup modified remotely, disabling");
                self.stop_sync_at(index).await;
                let entry = &mut self.syncs[index];
                entry.config.enabled = false;
                entry.config.error = SyncError::BackupModified;
                Self::notify_config_change(&self.app, entry);
                let drive = config_drive(&entry.config);
                self.store.mark_drive_dirty(&drive);
                self.flush_configs();
                continue;
            }

            if let Some(error) = out.fatal_error {
                self.stop_sync_at(index).await;
                let entry = &mut self.syncs[index];
                entry.config.enabled = false;
                entry.config.error = error;
                Self::notify_config_change(&self.app, entry);
                let drive = config_drive(&entry.config);
                self.store.mark_drive_dirty(&drive);
                self.flush_configs();
            }
        }

        self.report_stalls_and_conflicts();
        any_pending
    }

    /// Delivers transfer-engine completions to their owning syncs.
    async fn route_transfer_completions(&mut self) {
        let events = self.transfers.poll_completions().await;
        for event in events {
            let id = event.id();
            let Some(entry) = self.syncs.iter_mut().find(|e| {
                e.sync
                    .as_ref()
                    .map_or(false, |s| s.owns_transfer(id))
            }) else {
                continue;
            };
            let sync = entry.sync.as_mut().expect("matched on running sync");
            let backup_id = sync.backup_id();
            let mut tree_events = Vec::new();
            match event {
                TransferEvent::UploadCompleted {
                    id,
                    handle,
                    fingerprint,
                } => sync.note_upload_completed(id, handle, fingerprint, &mut tree_events),
                TransferEvent::DownloadCompleted { id, .. } => {
                    sync.note_download_completed(id, &mut tree_events);
                }
                TransferEvent::Terminated { id, reason } => {
                    sync.note_transfer_terminated(id, &reason);
                }
            }
            for event in &tree_events {
                self.app
                    .sync_tree_state(backup_id, &event.path, event.state, event.kind);
            }
        }
    }

    fn report_stalls_and_conflicts(&mut self) {
        let mut any_stalled = false;
        let mut any_conflicts = false;
        for entry in &self.syncs {
            let Some(sync) = &entry.sync else { continue };
            if sync.flags.stalled() {
                any_stalled = true;
            }
            if sync
                .flags
                .stalled_local_paths
                .values()
                .any(|r| *r == SyncWaitReason::NameClash)
            {
                any_conflicts = true;
            }
        }
        if any_stalled != self.stalled_reported {
            self.stalled_reported = any_stalled;
            self.app.sync_stalled(any_stalled);
        }
        if any_conflicts != self.conflicts_reported {
            self.conflicts_reported = any_conflicts;
            self.app.sync_conflicts(any_conflicts);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Drive key of a config: its external drive, or the internal store.
fn config_drive(config: &SyncConfig) -> PathBuf {
    config
        .external_drive
        .clone()
        .unwrap_or_else(PathBuf::new)
}

/// Platform notifier for a sync root, degrading to the no-op notifier (and
/// therefore periodic full rescans) when watching is unavailable.
fn make_notifier(root: &Path, waiter: &Waiter) -> Box<dyn DirNotifier> {
    let ignore = root.join(DEBRIS_DIR_NAME);
    match NotifyBackend::new(root, &ignore, waiter.clone()) {
        Ok(backend) => Box::new(backend),
        Err(err) => {
            warn!(root = %root.display(), error = %err, "falling back to full-rescan mode");
            Box::new(NoopNotifier::new())
        }
    }
}

/// Executes one tick's actions in emission order, reporting completions
/// back into the sync.
async fn execute_actions(
    sync: &mut Sync,
    actions: Vec<SyncAction>,
    cloud: &Arc<dyn CloudClient>,
    transfers: &Arc<dyn TransferEngine>,
    events: &mut Vec<TreeStateEvent>,
) {
    for action in actions {
        match action {
            SyncAction::FetchCloudChildren { handle } => {
                match cloud.fetch_children(handle).await {
                    Ok(children) => sync.note_children_fetched(handle, children),
                    Err(err) => {
                        warn!(%handle, error = %err, "fetch children failed");
                        sync.note_fetch_failed(handle);
                    }
                }
            }
            SyncAction::CloudCreate {
                parent,
                kind,
                name,
                mirror,
            } => match cloud.create_node(parent, kind, &name).await {
                Ok(handle) => sync.note_cloud_created(mirror, handle, events),
                Err(err) => {
                    let path = sync.mirror.full_path(mirror);
                    sync.note_action_failed(&path, &err.to_string());
                }
            },
            SyncAction::CloudRename { handle, new_name } => {
                match cloud.rename_node(handle, &new_name).await {
                    Ok(()) => sync.note_cloud_renamed(handle, &new_name),
                    Err(err) => warn!(%handle, error = %err, "cloud rename failed"),
                }
            }
            SyncAction::CloudMove { handle, new_parent } => {
                match cloud.move_node(handle, new_parent).await {
                    Ok(()) => sync.note_cloud_moved(handle, new_parent),
                    Err(err) => warn!(%handle, error = %err, "cloud move failed"),
                }
            }
            SyncAction::CloudDebris { handle } => match cloud.move_to_debris(handle).await {
                Ok(()) => sync.note_cloud_debris_done(handle),
                Err(err) => warn!(%handle, error = %err, "cloud debris move failed"),
            },
            SyncAction::LocalMkDir { path, mirror } => {
                match std::fs::create_dir_all(&path) {
                    Ok(()) => match cirrus_fs::stat(&path) {
                        Ok(st) => sync.note_local_dir_created(mirror, st.fsid, events),
                        Err(err) => sync.note_action_failed(&path, &err.to_string()),
                    },
                    Err(err) => sync.note_action_failed(&path, &err.to_string()),
                }
            }
            SyncAction::LocalRename { from, to, mirror } => {
                match cirrus_fs::rename(&from, &to) {
                    Ok(()) => sync.note_local_renamed(mirror, events),
                    Err(err) => sync.note_action_failed(&from, &err.to_string()),
                }
            }
            SyncAction::LocalDebris { path } => {
                let stored = sync
                    .local_debris()
                    .map(|debris| debris.store(&path))
                    .transpose();
                match stored {
                    Ok(_) => sync.note_local_debris_done(&path),
                    Err(err) => sync.note_action_failed(&path, &err.to_string()),
                }
            }
            SyncAction::StartUpload {
                path,
                parent,
                name,
                fingerprint,
                mirror,
            } => match transfers
                .start_upload(&path, parent, &name, fingerprint)
                .await
            {
                Ok(id) => sync.note_upload_started(mirror, id),
                Err(err) => sync.note_action_failed(&path, &err.to_string()),
            },
            SyncAction::StartDownload {
                handle,
                path,
                mirror,
            } => match transfers.start_download(handle, &path).await {
                Ok(id) => sync.note_download_started(mirror, id),
                Err(err) => sync.note_action_failed(&path, &err.to_string()),
            },
            SyncAction::CancelTransfer { id } => {
                if let Err(err) = transfers.cancel(id).await {
                    warn!(transfer = %id, error = %err, "transfer cancel failed");
                }
            }
        }
    }
}
