//! Asynchronous directory scanner
//!
//! Answers "what are the current filesystem entries under this directory?"
//! without blocking the reconciliation loop. A process-wide pool of worker
//! threads serves all syncs; the pool starts with the first [`ScanService`]
//! and stops with the last.
//!
//! The engine issues [`ScanService::scan`] and keeps ticking; the request
//! handle flips to completed once a worker has enumerated the directory, and
//! the service's [`Waiter`] is notified so the client loop wakes up. The
//! scanner never mutates mirror state.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use tracing::{debug, trace, warn};

use cirrus_core::domain::NodeKind;
use cirrus_core::ports::Waiter;
use cirrus_fs::{read_dir_entries, snapshot, FsEntry, FsError};

/// Worker threads in the shared pool.
const SCAN_THREADS: usize = 1;

// ============================================================================
// ScanRequest
// ============================================================================

/// An asynchronous scan request.
///
/// Results are single-consumer: [`take_results`](ScanRequest::take_results)
/// moves them out.
pub struct ScanRequest {
    /// Opaque id of the mirror node being scanned. A newer request for the
    /// same target supersedes this one.
    target: u64,
    target_path: PathBuf,
    follow_symlinks: bool,
    complete: AtomicBool,
    superseded: AtomicBool,
    reachable: AtomicBool,
    results: Mutex<Vec<FsEntry>>,
    waiter: Waiter,
}

impl ScanRequest {
    /// Whether the request has been processed.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Whether this request is for the given target.
    #[must_use]
    pub fn matches(&self, target: u64) -> bool {
        self.target == target
    }

    /// Whether the target directory existed when scanned. Only meaningful
    /// once `completed()`.
    #[must_use]
    pub fn was_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Takes ownership of the scan results.
    #[must_use]
    pub fn take_results(&self) -> Vec<FsEntry> {
        std::mem::take(&mut *self.results.lock().expect("results lock"))
    }

    fn finish(&self, reachable: bool, results: Vec<FsEntry>) {
        *self.results.lock().expect("results lock") = results;
        self.reachable.store(reachable, Ordering::Release);
        self.complete.store(true, Ordering::Release);
        self.waiter.notify();
    }
}

impl std::fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRequest")
            .field("target", &self.target)
            .field("path", &self.target_path)
            .field("completed", &self.completed())
            .finish()
    }
}

// ============================================================================
// Shared worker pool
// ============================================================================

#[derive(Default)]
struct PendingQueue {
    queue: Mutex<VecDeque<Arc<ScanRequest>>>,
    available: Condvar,
    shutdown: AtomicBool,
}

struct WorkerPool {
    shared: Arc<PendingQueue>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(num_threads: usize) -> Self {
        let shared = Arc::new(PendingQueue::default());
        let threads = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("cirrus-scan-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawn scan worker")
            })
            .collect();
        debug!(threads = num_threads, "scan worker pool started");
        Self { shared, threads }
    }

    fn queue(&self, request: Arc<ScanRequest>) {
        let mut q = self.shared.queue.lock().expect("scan queue lock");
        // A fresh scan for the same target supersedes anything still queued.
        for pending in q.iter() {
            if pending.target == request.target {
                pending.superseded.store(true, Ordering::Release);
            }
        }
        q.push_back(request);
        drop(q);
        self.shared.available.notify_one();
    }

    fn stop(self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for t in self.threads {
            let _ = t.join();
        }
        debug!("scan worker pool stopped");
    }
}

fn worker_loop(shared: &PendingQueue) {
    loop {
        let request = {
            let mut q = shared.queue.lock().expect("scan queue lock");
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(r) = q.pop_front() {
                    break r;
                }
                q = shared.available.wait(q).expect("scan queue wait");
            }
        };

        // Superseded requests are dropped on dequeue without scanning.
        if request.superseded.load(Ordering::Acquire) {
            trace!(target = request.target, "dropping superseded scan");
            continue;
        }

        scan_one(&request);
    }
}

fn scan_one(request: &ScanRequest) {
    match read_dir_entries(&request.target_path, true) {
        Ok(mut entries) => {
            if request.follow_symlinks {
                resolve_symlinks(&request.target_path, &mut entries);
            }
            trace!(
                target = request.target,
                path = %request.target_path.display(),
                entries = entries.len(),
                "scan complete"
            );
            request.finish(true, entries);
        }
        Err(FsError::NotFound(_)) => {
            // Directory vanished: complete empty with the unreachable flag so
            // the engine can distinguish "gone" from "empty".
            request.finish(false, Vec::new());
        }
        Err(err) => {
            warn!(
                path = %request.target_path.display(),
                error = %err,
                "scan failed"
            );
            request.finish(false, Vec::new());
        }
    }
}

/// Replaces symlink entries with the metadata of their targets. Dangling
/// links stay marked as symlinks and are left for the engine to skip.
fn resolve_symlinks(dir: &std::path::Path, entries: &mut [FsEntry]) {
    for entry in entries.iter_mut().filter(|e| e.is_symlink) {
        let path = dir.join(&entry.name);
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let followed = snapshot::stat(&path);
        if let Ok(st) = followed {
            entry.fsid = st.fsid;
        }
        entry.kind = if meta.is_dir() {
            NodeKind::Folder
        } else {
            NodeKind::File
        };
        entry.size = if meta.is_dir() { 0 } else { meta.len() };
        if let Ok(modified) = meta.modified() {
            entry.mtime = modified.into();
        }
        entry.is_symlink = false;
        if entry.kind == NodeKind::File {
            entry.fingerprint = cirrus_core::domain::FileFingerprint::of_file(&path).ok();
        }
    }
}

// ============================================================================
// Global pool lifecycle
// ============================================================================

struct GlobalPool {
    refs: usize,
    pool: Option<WorkerPool>,
}

fn global_pool() -> &'static Mutex<GlobalPool> {
    static POOL: OnceLock<Mutex<GlobalPool>> = OnceLock::new();
    POOL.get_or_init(|| {
        Mutex::new(GlobalPool {
            refs: 0,
            pool: None,
        })
    })
}

// ============================================================================
// ScanService
// ============================================================================

/// Per-sync handle on the shared scanner.
///
/// Creating the first service starts the worker pool; dropping the last one
/// stops it.
pub struct ScanService {
    waiter: Waiter,
}

impl ScanService {
    pub fn new(waiter: Waiter) -> Self {
        let mut global = global_pool().lock().expect("scan pool lock");
        global.refs += 1;
        if global.pool.is_none() {
            global.pool = Some(WorkerPool::start(SCAN_THREADS));
        }
        Self { waiter }
    }

    /// Issues a scan for `target` at `target_path`.
    ///
    /// Idempotent per target: a new scan supersedes any request still queued
    /// for the same target.
    pub fn scan(&self, target: u64, target_path: PathBuf, follow_symlinks: bool) -> Arc<ScanRequest> {
        let request = Arc::new(ScanRequest {
            target,
            target_path,
            follow_symlinks,
            complete: AtomicBool::new(false),
            superseded: AtomicBool::new(false),
            reachable: AtomicBool::new(false),
            results: Mutex::new(Vec::new()),
            waiter: self.waiter.clone(),
        });

        let global = global_pool().lock().expect("scan pool lock");
        if let Some(pool) = &global.pool {
            pool.queue(Arc::clone(&request));
        }
        request
    }
}

impl Drop for ScanService {
    fn drop(&mut self) {
        let mut global = global_pool().lock().expect("scan pool lock");
        global.refs -= 1;
        if global.refs == 0 {
            if let Some(pool) = global.pool.take() {
                pool.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_for(request: &ScanRequest) {
        for _ in 0..200 {
            if request.completed() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("scan did not complete");
    }

    #[test]
    fn scan_returns_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let service = ScanService::new(Waiter::new());
        let request = service.scan(1, dir.path().to_path_buf(), false);
        wait_for(&request);

        assert!(request.was_reachable());
        let mut results = request.take_results();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "a.txt");
        assert!(results[0].fingerprint.is_some());
        assert_eq!(results[1].kind, NodeKind::Folder);

        // Single-consumer: a second take yields nothing.
        assert!(request.take_results().is_empty());
    }

    #[test]
    fn missing_directory_completes_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");

        let service = ScanService::new(Waiter::new());
        let request = service.scan(2, gone, false);
        wait_for(&request);

        assert!(!request.was_reachable());
        assert!(request.take_results().is_empty());
    }

    #[test]
    fn completion_notifies_the_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let waiter = Waiter::new();
        let service = ScanService::new(waiter.clone());
        let request = service.scan(3, dir.path().to_path_buf(), false);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            waiter.wait(Duration::from_secs(5)).await;
        });
        // The notification may race the completion flag by a hair.
        wait_for(&request);
        assert!(request.completed());
    }

    #[test]
    fn request_matches_its_target() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScanService::new(Waiter::new());
        let request = service.scan(7, dir.path().to_path_buf(), false);
        assert!(request.matches(7));
        assert!(!request.matches(8));
        wait_for(&request);
    }
}
