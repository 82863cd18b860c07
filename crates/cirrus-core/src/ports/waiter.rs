//! Client waiter
//!
//! The client loop sleeps between ticks; collaborators (scanner workers,
//! transfer completions, notification backends) wake it through this handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Wakes the client loop from any thread.
///
/// Cheap to clone; all clones share one underlying notifier. A `notify` that
/// arrives while nobody waits is latched and satisfies the next `wait`, so
/// completions cannot be lost between ticks.
#[derive(Debug, Clone, Default)]
pub struct Waiter {
    inner: Arc<Notify>,
}

impl Waiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the client loop. Callable from non-async threads.
    pub fn notify(&self) {
        self.inner.notify_one();
    }

    /// Waits until notified or until `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.inner.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_before_wait_is_latched() {
        let w = Waiter::new();
        w.notify();
        // Must return promptly because the permit is stored.
        w.wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn wait_times_out_without_notification() {
        let w = Waiter::new();
        let started = std::time::Instant::now();
        w.wait(Duration::from_millis(20)).await;
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn notify_from_plain_thread() {
        let w = Waiter::new();
        let w2 = w.clone();
        std::thread::spawn(move || w2.notify()).join().unwrap();
    }
}
