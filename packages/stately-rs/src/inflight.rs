//! Activity tracking for quiescence.
//!
//! Every unit of pending work in a store holds an [`ActivityGuard`]: messages
//! waiting in the mailbox, running invocations, queued calls and armed
//! debounce timers. The store is idle when no guard is alive, which is what
//! [`ActivityTracker::wait_idle`] waits for.
//!
//! Guards hand off rather than overlap gaps: a spawned operation takes its
//! own guard before the message that started it is released, and the
//! completion message carries that guard back into the mailbox.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::StoreError;

/// Counts outstanding work and wakes waiters when it reaches zero.
#[derive(Default)]
pub struct ActivityTracker {
    /// Pending work items.
    count: AtomicUsize,
    /// Notifier for waiters when count hits zero.
    notify: Notify,
}

impl ActivityTracker {
    /// Create a new tracker.
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Begin tracking one unit of work. The count drops when the guard does.
    pub fn guard(self: &Arc<Self>) -> ActivityGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ActivityGuard {
            tracker: self.clone(),
        }
    }

    fn release(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Number of units of work currently pending.
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true if nothing is pending.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until nothing is pending, or fail after `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(timeout, self.wait_zero())
            .await
            .map_err(|_| StoreError::Timeout { duration: timeout })
    }

    async fn wait_zero(&self) {
        loop {
            // Register for notification BEFORE checking count
            let notified = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
            // Notify is edge-triggered: recheck
        }
    }
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("pending", &self.pending())
            .finish()
    }
}

/// RAII guard for one unit of pending work.
///
/// Ensures the count is decremented even if the holder panics or is
/// cancelled, so `wait_idle` never hangs on abandoned work.
pub struct ActivityGuard {
    tracker: Arc<ActivityTracker>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

impl std::fmt::Debug for ActivityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ActivityGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_increments_and_releases() {
        let tracker = Arc::new(ActivityTracker::new());
        assert!(tracker.is_idle());

        let a = tracker.guard();
        let b = tracker.guard();
        assert_eq!(tracker.pending(), 2);

        drop(a);
        assert_eq!(tracker.pending(), 1);
        drop(b);
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_guard_panic_safety() {
        let tracker = Arc::new(ActivityTracker::new());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = tracker.guard();
            panic!("simulated panic");
        }));

        assert!(result.is_err());
        assert!(tracker.is_idle());
    }

    #[tokio::test]
    async fn test_wait_idle_immediate() {
        let tracker = Arc::new(ActivityTracker::new());
        tracker
            .wait_idle(Duration::from_millis(10))
            .await
            .expect("idle tracker should not wait");
    }

    #[tokio::test]
    async fn test_wait_idle_with_work() {
        let tracker = Arc::new(ActivityTracker::new());
        let guard = tracker.guard();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard);
        });

        tracker.wait_idle(Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_times_out() {
        let tracker = Arc::new(ActivityTracker::new());
        let _guard = tracker.guard();

        let result = tracker.wait_idle(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StoreError::Timeout { .. })));
    }
}
