//! Directory change notification
//!
//! The engine consumes change notifications through the [`DirNotifier`]
//! trait: four queues of `(relative path, timestamp, kind)` records. The
//! default backend wraps the `notify` crate; platforms or situations where
//! notification is unavailable use [`NoopNotifier`], whose permanent
//! `failed` state makes the engine fall back to periodic full rescans.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use cirrus_core::ports::Waiter;

use crate::FsError;

// ============================================================================
// Notification record
// ============================================================================

/// Which queue a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyQueue {
    /// Ordinary directory events.
    DirEvents,
    /// Entries being retried after a transient failure; drained with backoff.
    Retry,
    /// Low-confidence extra hints (e.g. files that may still be written to).
    Extra,
    /// Events under the sync's own debris folder; never synchronized.
    Debris,
}

impl NotifyQueue {
    pub const ALL: [NotifyQueue; 4] = [
        NotifyQueue::DirEvents,
        NotifyQueue::Retry,
        NotifyQueue::Extra,
        NotifyQueue::Debris,
    ];

    fn index(self) -> usize {
        match self {
            NotifyQueue::DirEvents => 0,
            NotifyQueue::Retry => 1,
            NotifyQueue::Extra => 2,
            NotifyQueue::Debris => 3,
        }
    }
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Path relative to the sync root. Empty for the root itself.
    pub relative_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub queue: NotifyQueue,
    /// Marks the whole subtree below `relative_path` for rescan (used for
    /// overflow events where individual paths were lost).
    pub deep: bool,
}

// ============================================================================
// DirNotifier trait
// ============================================================================

/// Source of directory change notifications for one sync.
pub trait DirNotifier: Send {
    /// Takes the oldest entry of `queue`, if any.
    fn pop(&mut self, queue: NotifyQueue) -> Option<Notification>;

    /// Appends a notification, coalescing an immediate duplicate at the tail
    /// of its queue.
    fn push(&mut self, notification: Notification);

    /// Number of pending entries across all queues.
    fn pending(&self) -> usize;

    /// Whether delivery has failed; the engine switches to periodic full
    /// rescans while this is set.
    fn failed(&self) -> bool;

    /// Why delivery failed, when `failed()`.
    fn fail_reason(&self) -> Option<String>;
}

// ============================================================================
// Shared queue state
// ============================================================================

#[derive(Debug, Default)]
struct QueueState {
    queues: [VecDeque<Notification>; 4],
    failed: bool,
    fail_reason: Option<String>,
}

impl QueueState {
    fn push(&mut self, n: Notification) {
        let q = &mut self.queues[n.queue.index()];
        // Coalesce immediate duplicates at the tail: rapid-fire writes to one
        // file produce a burst of identical paths.
        if let Some(tail) = q.back_mut() {
            if tail.relative_path == n.relative_path && tail.deep == n.deep {
                tail.timestamp = n.timestamp;
                return;
            }
        }
        q.push_back(n);
    }

    fn pending(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

// ============================================================================
// Notify-crate backend
// ============================================================================

/// Change notifier backed by the platform watcher (inotify on Linux).
///
/// Events under `ignore_path` (the sync's debris directory) are routed to the
/// `Debris` queue. Watcher errors latch `failed`.
pub struct NotifyBackend {
    state: Arc<Mutex<QueueState>>,
    // Kept alive for the duration of the watch; dropping stops delivery.
    _watcher: RecommendedWatcher,
}

impl NotifyBackend {
    /// Starts watching `root` recursively.
    pub fn new(root: &Path, ignore_path: &Path, waiter: Waiter) -> Result<Self, FsError> {
        let state = Arc::new(Mutex::new(QueueState::default()));
        let cb_state = Arc::clone(&state);
        let cb_root = root.to_path_buf();
        let cb_ignore = ignore_path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                let mut guard = match cb_state.lock() {
                    Ok(g) => g,
                    Err(_) => return,
                };
                match res {
                    Ok(event) => {
                        enqueue_event(&mut guard, &event, &cb_root, &cb_ignore);
                    }
                    Err(err) => {
                        warn!(error = %err, "directory watcher error");
                        guard.failed = true;
                        guard.fail_reason = Some(err.to_string());
                    }
                }
                drop(guard);
                waiter.notify();
            },
            notify::Config::default(),
        )
        .map_err(|e| FsError::NotifyUnavailable(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| FsError::NotifyUnavailable(e.to_string()))?;

        debug!(root = %root.display(), "directory watcher started");

        Ok(Self {
            state,
            _watcher: watcher,
        })
    }
}

fn enqueue_event(state: &mut QueueState, event: &notify::Event, root: &Path, ignore: &Path) {
    if event.need_rescan() {
        // The OS dropped events; the only safe answer is a full rescan.
        state.push(Notification {
            relative_path: PathBuf::new(),
            timestamp: Utc::now(),
            queue: NotifyQueue::DirEvents,
            deep: true,
        });
        return;
    }

    let interesting = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    if !interesting {
        return;
    }

    for path in &event.paths {
        let queue = if path.starts_with(ignore) {
            NotifyQueue::Debris
        } else {
            NotifyQueue::DirEvents
        };
        let relative = match path.strip_prefix(root) {
            Ok(r) => r.to_path_buf(),
            Err(_) => continue,
        };
        state.push(Notification {
            relative_path: relative,
            timestamp: Utc::now(),
            queue,
            deep: false,
        });
    }
}

impl DirNotifier for NotifyBackend {
    fn pop(&mut self, queue: NotifyQueue) -> Option<Notification> {
        self.state.lock().ok()?.queues[queue.index()].pop_front()
    }

    fn push(&mut self, notification: Notification) {
        if let Ok(mut guard) = self.state.lock() {
            guard.push(notification);
        }
    }

    fn pending(&self) -> usize {
        self.state.lock().map(|g| g.pending()).unwrap_or(0)
    }

    fn failed(&self) -> bool {
        self.state.lock().map(|g| g.failed).unwrap_or(true)
    }

    fn fail_reason(&self) -> Option<String> {
        self.state.lock().ok().and_then(|g| g.fail_reason.clone())
    }
}

// ============================================================================
// No-op notifier
// ============================================================================

/// Notifier that never delivers anything and reports itself failed, putting
/// the engine in periodic full-rescan mode. Pushed entries (retries) are
/// still queued and popped normally.
#[derive(Debug, Default)]
pub struct NoopNotifier {
    state: QueueState,
}

impl NoopNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DirNotifier for NoopNotifier {
    fn pop(&mut self, queue: NotifyQueue) -> Option<Notification> {
        self.state.queues[queue.index()].pop_front()
    }

    fn push(&mut self, notification: Notification) {
        self.state.push(notification);
    }

    fn pending(&self) -> usize {
        self.state.pending()
    }

    fn failed(&self) -> bool {
        true
    }

    fn fail_reason(&self) -> Option<String> {
        Some("change notification not available".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(path: &str, queue: NotifyQueue) -> Notification {
        Notification {
            relative_path: PathBuf::from(path),
            timestamp: Utc::now(),
            queue,
            deep: false,
        }
    }

    #[test]
    fn noop_notifier_reports_failed() {
        let notifier = NoopNotifier::new();
        assert!(notifier.failed());
        assert!(notifier.fail_reason().is_some());
    }

    #[test]
    fn queues_are_independent() {
        let mut notifier = NoopNotifier::new();
        notifier.push(n("a", NotifyQueue::DirEvents));
        notifier.push(n("b", NotifyQueue::Retry));

        assert!(notifier.pop(NotifyQueue::Extra).is_none());
        assert_eq!(
            notifier.pop(NotifyQueue::Retry).unwrap().relative_path,
            PathBuf::from("b")
        );
        assert_eq!(
            notifier.pop(NotifyQueue::DirEvents).unwrap().relative_path,
            PathBuf::from("a")
        );
    }

    #[test]
    fn tail_duplicates_coalesce() {
        let mut notifier = NoopNotifier::new();
        notifier.push(n("f.txt", NotifyQueue::DirEvents));
        notifier.push(n("f.txt", NotifyQueue::DirEvents));
        notifier.push(n("f.txt", NotifyQueue::DirEvents));
        assert_eq!(notifier.pending(), 1);

        // A different path in between breaks the run.
        notifier.push(n("g.txt", NotifyQueue::DirEvents));
        notifier.push(n("f.txt", NotifyQueue::DirEvents));
        assert_eq!(notifier.pending(), 3);
    }

    #[test]
    fn watcher_backend_delivers_events() {
        let dir = tempfile::tempdir().unwrap();
        let debris = dir.path().join(".debris");
        let waiter = Waiter::new();
        let mut backend = match NotifyBackend::new(dir.path(), &debris, waiter) {
            Ok(b) => b,
            // Inotify may be unavailable in constrained environments.
            Err(FsError::NotifyUnavailable(_)) => return,
            Err(e) => panic!("{e}"),
        };

        std::fs::write(dir.path().join("new.txt"), b"x").unwrap();

        // Give the watcher thread a moment to deliver.
        let mut seen = None;
        for _ in 0..50 {
            if let Some(note) = backend.pop(NotifyQueue::DirEvents) {
                seen = Some(note);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let seen = seen.expect("no notification delivered");
        assert_eq!(seen.relative_path, PathBuf::from("new.txt"));
        assert!(!backend.failed());
    }
}
