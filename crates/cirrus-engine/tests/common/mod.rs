//! In-memory fakes of the engine's ports, shared by the scenario tests.
//!
//! `FakeCloud` models the remote tree (nodes + file content) behind the
//! `CloudClient` trait; `FakeTransfers` moves bytes between the local disk
//! and that model and completes synchronously; `RecordingApp` captures every
//! app notification for assertions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use cirrus_core::domain::{
    BackupId, CloudNode, FileFingerprint, NodeHandle, NodeKind, SyncConfig, SyncDirection,
    TransferId, TreeState,
};
use cirrus_core::ports::{AppEventSink, CloudClient, TransferEngine, TransferEvent, Waiter};
use cirrus_engine::Syncs;
use cirrus_store::SyncConfigIoContext;

pub const ROOT_HANDLE: NodeHandle = NodeHandle::new(1);
pub const DEBRIS_HANDLE: NodeHandle = NodeHandle::new(2);

/// Fingerprint of a small content buffer, matching what
/// `FileFingerprint::of_file` computes for files below the window budget.
pub fn fingerprint_of(bytes: &[u8], mtime: DateTime<Utc>) -> FileFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    let digest = u64::from_be_bytes(out[..8].try_into().unwrap());
    FileFingerprint::new(bytes.len() as u64, mtime, digest)
}

// ============================================================================
// FakeCloud
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeCloudState {
    pub nodes: HashMap<NodeHandle, CloudNode>,
    pub content: HashMap<NodeHandle, Vec<u8>>,
    next_handle: u64,
    pub create_count: usize,
    pub rename_count: usize,
    pub move_count: usize,
    pub debris_count: usize,
    pub upload_count: usize,
    pub download_count: usize,
}

impl FakeCloudState {
    pub fn new() -> Self {
        let mut state = Self {
            next_handle: 10,
            ..Self::default()
        };
        state
            .nodes
            .insert(ROOT_HANDLE, CloudNode::folder(ROOT_HANDLE, None, "root"));
        state.nodes.insert(
            DEBRIS_HANDLE,
            CloudNode::folder(DEBRIS_HANDLE, None, "SyncDebris"),
        );
        state
    }

    pub fn fresh_handle(&mut self) -> NodeHandle {
        let handle = NodeHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// A second top-level root, for multi-sync scenarios.
    pub fn add_root(&mut self, name: &str) -> NodeHandle {
        let handle = self.fresh_handle();
        self.nodes
            .insert(handle, CloudNode::folder(handle, None, name));
        handle
    }

    pub fn add_folder(&mut self, parent: NodeHandle, name: &str) -> NodeHandle {
        let handle = self.fresh_handle();
        self.nodes
            .insert(handle, CloudNode::folder(handle, Some(parent), name));
        handle
    }

    pub fn add_file(
        &mut self,
        parent: NodeHandle,
        name: &str,
        bytes: &[u8],
        mtime: DateTime<Utc>,
    ) -> NodeHandle {
        let handle = self.fresh_handle();
        let fingerprint = fingerprint_of(bytes, mtime);
        self.nodes
            .insert(handle, CloudNode::file(handle, parent, name, fingerprint));
        self.content.insert(handle, bytes.to_vec());
        handle
    }

    pub fn set_file_content(&mut self, handle: NodeHandle, bytes: &[u8], mtime: DateTime<Utc>) {
        let fingerprint = fingerprint_of(bytes, mtime);
        if let Some(node) = self.nodes.get_mut(&handle) {
            node.fingerprint = Some(fingerprint);
            node.size = bytes.len() as u64;
            node.mtime = mtime;
        }
        self.content.insert(handle, bytes.to_vec());
    }

    pub fn children_of(&self, parent: NodeHandle) -> Vec<CloudNode> {
        self.nodes
            .values()
            .filter(|n| n.parent == Some(parent))
            .cloned()
            .collect()
    }

    pub fn child_by_name(&self, parent: NodeHandle, name: &str) -> Option<CloudNode> {
        self.children_of(parent).into_iter().find(|n| n.name == name)
    }
}

#[derive(Clone)]
pub struct FakeCloud(pub Arc<Mutex<FakeCloudState>>);

impl FakeCloud {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(FakeCloudState::new())))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeCloudState> {
        self.0.lock().unwrap()
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn create_node(
        &self,
        parent: NodeHandle,
        kind: NodeKind,
        name: &str,
    ) -> anyhow::Result<NodeHandle> {
        let mut state = self.state();
        state.create_count += 1;
        let handle = state.fresh_handle();
        let node = match kind {
            NodeKind::Folder => CloudNode::folder(handle, Some(parent), name),
            NodeKind::File => {
                CloudNode::file(handle, parent, name, fingerprint_of(b"", Utc::now()))
            }
        };
        state.nodes.insert(handle, node);
        Ok(handle)
    }

    async fn rename_node(&self, handle: NodeHandle, new_name: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        state.rename_count += 1;
        state
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| anyhow::anyhow!("no such node"))?
            .name = new_name.to_string();
        Ok(())
    }

    async fn move_node(&self, handle: NodeHandle, new_parent: NodeHandle) -> anyhow::Result<()> {
        let mut state = self.state();
        state.move_count += 1;
        state
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| anyhow::anyhow!("no such node"))?
            .parent = Some(new_parent);
        Ok(())
    }

    async fn delete_node(&self, handle: NodeHandle) -> anyhow::Result<()> {
        self.state().nodes.remove(&handle);
        Ok(())
    }

    async fn fetch_children(&self, handle: NodeHandle) -> anyhow::Result<Vec<CloudNode>> {
        Ok(self.state().children_of(handle))
    }

    async fn fetch_node(&self, handle: NodeHandle) -> anyhow::Result<Option<CloudNode>> {
        Ok(self.state().nodes.get(&handle).cloned())
    }

    async fn debris_folder(&self) -> anyhow::Result<NodeHandle> {
        Ok(DEBRIS_HANDLE)
    }

    async fn move_to_debris(&self, handle: NodeHandle) -> anyhow::Result<()> {
        let mut state = self.state();
        state.debris_count += 1;
        state
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| anyhow::anyhow!("no such node"))?
            .parent = Some(DEBRIS_HANDLE);
        Ok(())
    }
}

// ============================================================================
// FakeTransfers
// ============================================================================

pub struct FakeTransfers {
    cloud: Arc<Mutex<FakeCloudState>>,
    events: Mutex<Vec<TransferEvent>>,
    next_id: AtomicU64,
}

impl FakeTransfers {
    pub fn new(cloud: &FakeCloud) -> Self {
        Self {
            cloud: Arc::clone(&cloud.0),
            events: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self) -> TransferId {
        TransferId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl TransferEngine for FakeTransfers {
    async fn start_upload(
        &self,
        local_path: &Path,
        parent: NodeHandle,
        name: &str,
        _fingerprint: FileFingerprint,
    ) -> anyhow::Result<TransferId> {
        let id = self.fresh_id();
        let bytes = std::fs::read(local_path)?;
        let fingerprint = FileFingerprint::of_file(local_path)?;
        let mut cloud = self.cloud.lock().unwrap();
        cloud.upload_count += 1;
        // Replace an existing child of the same name (new version).
        let existing = cloud
            .children_of(parent)
            .into_iter()
            .find(|n| n.name == name)
            .map(|n| n.handle);
        let handle = match existing {
            Some(handle) => {
                if let Some(node) = cloud.nodes.get_mut(&handle) {
                    node.fingerprint = Some(fingerprint);
                    node.size = fingerprint.size;
                    node.mtime = fingerprint.mtime;
                }
                handle
            }
            None => {
                let handle = cloud.fresh_handle();
                cloud
                    .nodes
                    .insert(handle, CloudNode::file(handle, parent, name, fingerprint));
                handle
            }
        };
        cloud.content.insert(handle, bytes);
        drop(cloud);
        self.events.lock().unwrap().push(TransferEvent::UploadCompleted {
            id,
            handle,
            fingerprint,
        });
        Ok(id)
    }

    async fn start_download(
        &self,
        handle: NodeHandle,
        local_path: &Path,
    ) -> anyhow::Result<TransferId> {
        let id = self.fresh_id();
        let mut cloud = self.cloud.lock().unwrap();
        cloud.download_count += 1;
        let bytes = cloud
            .content
            .get(&handle)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no content for node"))?;
        drop(cloud);
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_path, &bytes)?;
        self.events
            .lock()
            .unwrap()
            .push(TransferEvent::DownloadCompleted {
                id,
                local_path: local_path.to_path_buf(),
            });
        Ok(id)
    }

    async fn cancel(&self, _id: TransferId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn poll_completions(&self) -> Vec<TransferEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

// ============================================================================
// RecordingApp
// ============================================================================

#[derive(Debug, Default)]
pub struct RecordingApp {
    pub state_config_events: Mutex<Vec<BackupId>>,
    pub stalled_events: Mutex<Vec<bool>>,
    pub conflict_events: Mutex<Vec<bool>>,
    pub tree_state_events: Mutex<Vec<(PathBuf, TreeState)>>,
}

impl RecordingApp {
    pub fn state_config_count(&self, id: BackupId) -> usize {
        self.state_config_events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == id)
            .count()
    }

    pub fn last_stalled(&self) -> Option<bool> {
        self.stalled_events.lock().unwrap().last().copied()
    }
}

impl AppEventSink for RecordingApp {
    fn sync_tree_state(&self, _id: BackupId, path: &Path, state: TreeState, _kind: NodeKind) {
        self.tree_state_events
            .lock()
            .unwrap()
            .push((path.to_path_buf(), state));
    }

    fn sync_state_config(&self, id: BackupId) {
        self.state_config_events.lock().unwrap().push(id);
    }

    fn sync_stalled(&self, stalled: bool) {
        self.stalled_events.lock().unwrap().push(stalled);
    }

    fn sync_conflicts(&self, conflicts: bool) {
        self.conflict_events.lock().unwrap().push(conflicts);
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub tmp: TempDir,
    pub local_root: PathBuf,
    pub cloud: FakeCloud,
    pub app: Arc<RecordingApp>,
    pub syncs: Syncs,
}

pub fn io_context() -> SyncConfigIoContext {
    SyncConfigIoContext::new([7u8; 32], [9u8; 32], "itest")
}

/// Builds a harness with one local root directory and an empty fake cloud.
pub fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let tmp = TempDir::new().unwrap();
    let local_root = tmp.path().join("local");
    std::fs::create_dir_all(&local_root).unwrap();
    let client_db = tmp.path().join("db");
    std::fs::create_dir_all(&client_db).unwrap();

    let cloud = FakeCloud::new();
    let app = Arc::new(RecordingApp::default());
    let transfers = Arc::new(FakeTransfers::new(&cloud));
    let syncs = Syncs::new(
        client_db,
        io_context(),
        Arc::new(cloud.clone()),
        transfers,
        app.clone(),
        Waiter::new(),
    );

    Harness {
        tmp,
        local_root,
        cloud,
        app,
        syncs,
    }
}

pub fn config(id: u64, local_root: &Path, direction: SyncDirection) -> SyncConfig {
    SyncConfig::new(
        BackupId::new(id),
        local_root.to_path_buf(),
        format!("sync-{id}"),
        ROOT_HANDLE,
        "/root".to_string(),
        direction,
    )
}

/// Ticks all syncs until nothing has work pending (or the round budget runs
/// out). `now` is skewed into the future so the nagle delay never blocks a
/// settled file.
pub async fn run_until_quiescent(syncs: &mut Syncs) -> usize {
    let mut rounds = 0;
    loop {
        rounds += 1;
        let now = Utc::now() + chrono::Duration::seconds(10);
        let pending = syncs.tick_all(now).await;
        if !pending {
            return rounds;
        }
        assert!(rounds < 200, "sync did not quiesce");
        syncs
            .waiter()
            .wait(std::time::Duration::from_millis(30))
            .await;
    }
}
