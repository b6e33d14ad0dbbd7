//! Trailing-edge debounce timers.
//!
//! Each action has two independent buckets:
//!
//! | Kind         | What is delayed                      |
//! |--------------|--------------------------------------|
//! | `Invocation` | the whole call (effects and all)     |
//! | `SideEffect` | only the side effect after a commit  |
//!
//! Scheduling into a bucket that already has pending work replaces it: the
//! old timer is aborted and its payload handed back so the caller can settle
//! it. When a timer fires it only *reports* (with its generation) through the
//! callback given at schedule time; the dispatch loop then claims the payload
//! with [`DebounceScheduler::fire`]. A report from a replaced timer carries a
//! stale generation and claims nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// Which debounce bucket of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebounceKind {
    /// Delays the whole invocation.
    Invocation,
    /// Delays only the side effect.
    SideEffect,
}

impl fmt::Display for DebounceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebounceKind::Invocation => write!(f, "invocation"),
            DebounceKind::SideEffect => write!(f, "side_effect"),
        }
    }
}

/// Identifies one debounce bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    /// Action name.
    pub action: Arc<str>,
    /// Bucket kind.
    pub kind: DebounceKind,
}

impl DebounceKey {
    /// Create a key.
    pub fn new(action: Arc<str>, kind: DebounceKind) -> Self {
        Self { action, kind }
    }
}

struct Pending<T> {
    generation: u64,
    timer: JoinHandle<()>,
    payload: T,
}

/// One pending timer per bucket.
pub(crate) struct DebounceScheduler<T> {
    pending: HashMap<DebounceKey, Pending<T>>,
    next_generation: u64,
}

impl<T> Default for DebounceScheduler<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            next_generation: 1,
        }
    }
}

impl<T> DebounceScheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer of `key`.
    ///
    /// After `delay`, `elapsed(key, generation)` is called from a timer task.
    /// Returns the payload this call replaced, if any.
    pub fn schedule<F>(&mut self, key: DebounceKey, delay: Duration, payload: T, elapsed: F) -> Option<T>
    where
        F: FnOnce(DebounceKey, u64) + Send + 'static,
    {
        let generation = self.next_generation;
        self.next_generation += 1;

        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            elapsed(timer_key, generation);
        });

        trace!(action = %key.action, kind = %key.kind, generation, ?delay, "debounce armed");
        let replaced = self.pending.insert(
            key,
            Pending {
                generation,
                timer,
                payload,
            },
        );
        replaced.map(|old| {
            old.timer.abort();
            old.payload
        })
    }

    /// Claim the payload of a timer that elapsed.
    ///
    /// Returns `None` if the timer was replaced or cancelled in the meantime.
    pub fn fire(&mut self, key: &DebounceKey, generation: u64) -> Option<T> {
        match self.pending.get(key) {
            Some(p) if p.generation == generation => self.pending.remove(key).map(|p| p.payload),
            _ => None,
        }
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Abort every timer without firing. Returns the pending payloads.
    pub fn cancel_all(&mut self) -> Vec<T> {
        self.pending
            .drain()
            .map(|(_, p)| {
                p.timer.abort();
                p.payload
            })
            .collect()
    }
}

impl<T> Drop for DebounceScheduler<T> {
    fn drop(&mut self) {
        for p in self.pending.values() {
            p.timer.abort();
        }
    }
}
