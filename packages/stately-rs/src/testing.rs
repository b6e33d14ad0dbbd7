//! Testing utilities for stores and actions.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! stately = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Holding operations open with `OperationGate`
//!
//! Conflict and abort tests need operations that stay in flight until the
//! test says otherwise:
//!
//! ```ignore
//! use stately::testing::OperationGate;
//!
//! let gate = OperationGate::new();
//! let store = Store::builder(State::default)
//!     .action("load", {
//!         let gate = gate.clone();
//!         move |a| a.asynchronous(move |n: u32, _ctx| {
//!             let gate = gate.clone();
//!             async move {
//!                 gate.pass().await;
//!                 anyhow::Ok(n)
//!             }
//!         })
//!     })
//!     .build()?;
//!
//! let first = store.actions().call("load", 1u32);
//! gate.wait_entered(1).await;
//! assert!(store.is_loading("load", None));
//! gate.release(1);
//! first.await?;
//! ```
//!
//! # Observing the lifecycle with `RecordingMiddleware`
//!
//! ```ignore
//! let recorder = RecordingMiddleware::new();
//! let store = Store::builder(State::default)
//!     .middleware(recorder.clone())
//!     ...;
//!
//! store.actions().call("add", 1i64).await?;
//! assert_eq!(recorder.events(), vec!["dispatch:add", "effect:add:sync"]);
//! ```

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};

use crate::core::{ActionArgs, State};
use crate::error::EffectPhase;
use crate::middleware::{
    AbortEvent, DispatchEvent, EffectEvent, ErrorEvent, Flow, Middleware, RollbackEvent,
};

/// Install a `tracing` subscriber for tests, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,stately=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// =============================================================================
// OperationGate
// =============================================================================

/// A gate that operations wait at until the test releases them.
///
/// Cloning shares the gate.
#[derive(Debug, Clone)]
pub struct OperationGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    permits: Semaphore,
    entered: AtomicUsize,
    notify: Notify,
}

impl Default for OperationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationGate {
    /// A closed gate.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                permits: Semaphore::new(0),
                entered: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Wait until the test lets one caller through.
    pub async fn pass(&self) {
        self.inner.entered.fetch_add(1, Ordering::AcqRel);
        self.inner.notify.notify_waiters();
        // The semaphore is never closed.
        if let Ok(permit) = self.inner.permits.acquire().await {
            permit.forget();
        }
    }

    /// Let `n` waiting (or future) callers through.
    pub fn release(&self, n: usize) {
        self.inner.permits.add_permits(n);
    }

    /// How many callers reached the gate so far.
    pub fn entered(&self) -> usize {
        self.inner.entered.load(Ordering::Acquire)
    }

    /// Wait until at least `n` callers reached the gate.
    pub async fn wait_entered(&self, n: usize) {
        loop {
            // Register before checking, so a pass() in between is not missed.
            let notified = self.inner.notify.notified();
            if self.entered() >= n {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Latch
// =============================================================================

/// Counts down expected events; `wait` returns once all have happened.
///
/// ```ignore
/// let latch = Latch::new(3);
/// let _sub = store.subscribe(|s| s.count, {
///     let latch = latch.clone();
///     move |_| latch.count_down()
/// });
/// ```
#[derive(Debug, Clone)]
pub struct Latch {
    inner: Arc<(AtomicUsize, Notify)>,
}

impl Latch {
    /// A latch expecting `expected` events.
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new((AtomicUsize::new(expected), Notify::new())),
        }
    }

    /// Record one event.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn count_down(&self) {
        let prev = self.inner.0.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("Latch counted down below zero - more events than expected");
        }
        if prev == 1 {
            self.inner.1.notify_waiters();
        }
    }

    /// Wait until every expected event happened.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.1.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Events still expected.
    pub fn remaining(&self) -> usize {
        self.inner.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// RecordingMiddleware
// =============================================================================

type AnyState = Arc<dyn Any + Send + Sync>;

/// One middleware hook call with what the hook received.
#[derive(Clone)]
pub struct RecordedEvent {
    /// `dispatch`, `effect`, `error`, `abort` or `rollback`.
    pub hook: &'static str,
    /// Action name.
    pub action: String,
    /// The call's arguments.
    pub args: ActionArgs,
    /// Operation id, for error, abort and rollback.
    pub operation_id: Option<String>,
    /// Effect phase, for effect events.
    pub phase: Option<EffectPhase>,
    before: AnyState,
    after: Option<AnyState>,
}

impl RecordedEvent {
    /// The call's arguments, if they have type `A`.
    pub fn args<A: Any>(&self) -> Option<&A> {
        self.args.downcast_ref()
    }

    /// State the hook saw as "before" (the committed state for dispatch).
    pub fn before<S: Any>(&self) -> Option<&S> {
        self.before.downcast_ref()
    }

    /// State the hook saw as "after" (the restored state for rollback).
    pub fn after<S: Any>(&self) -> Option<&S> {
        self.after.as_ref()?.downcast_ref()
    }
}

impl fmt::Debug for RecordedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedEvent")
            .field("hook", &self.hook)
            .field("action", &self.action)
            .field("args", &self.args.type_name())
            .field("operation_id", &self.operation_id)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Middleware that records every hook call.
///
/// [`events`](Self::events) gives short strings for ordering assertions:
/// `dispatch:<action>`, `effect:<action>:<phase>`, `error:<action>`,
/// `abort:<action>#<operation id>`, `rollback:<action>`.
/// [`recorded`](Self::recorded) keeps the arguments and states as well.
#[derive(Debug, Clone, Default)]
pub struct RecordingMiddleware {
    events: Arc<Mutex<Vec<String>>>,
    recorded: Arc<Mutex<Vec<RecordedEvent>>>,
    halt: Arc<Mutex<Option<String>>>,
}

impl RecordingMiddleware {
    /// A recorder that lets every call through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Halt every dispatch of `action` from now on.
    pub fn halt_action(&self, action: impl Into<String>) {
        *self.halt.lock().unwrap_or_else(|e| e.into_inner()) = Some(action.into());
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded events starting with `prefix`.
    pub fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    /// Full records of every hook call so far.
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Full records of one hook's calls.
    pub fn recorded_for(&self, hook: &str) -> Vec<RecordedEvent> {
        self.recorded()
            .into_iter()
            .filter(|e| e.hook == hook)
            .collect()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.recorded.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn record(&self, summary: String, event: RecordedEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(summary);
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl<S: State> Middleware<S> for RecordingMiddleware {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_dispatch(&self, event: &DispatchEvent<'_, S>) -> Flow {
        self.record(
            format!("dispatch:{}", event.action),
            RecordedEvent {
                hook: "dispatch",
                action: event.action.to_string(),
                args: event.args.clone(),
                operation_id: None,
                phase: None,
                before: event.state.clone(),
                after: None,
            },
        );
        let halted = self.halt.lock().unwrap_or_else(|e| e.into_inner());
        match halted.as_deref() {
            Some(action) if action == event.action => Flow::halt(format!("{} is halted", action)),
            _ => Flow::Continue,
        }
    }

    fn on_effect(&self, event: &EffectEvent<'_, S>) {
        self.record(
            format!("effect:{}:{}", event.action, event.phase),
            RecordedEvent {
                hook: "effect",
                action: event.action.to_string(),
                args: event.args.clone(),
                operation_id: None,
                phase: Some(event.phase),
                before: event.before.clone(),
                after: Some(event.after.clone()),
            },
        );
    }

    fn on_error(&self, event: &ErrorEvent<'_, S>) {
        self.record(
            format!("error:{}", event.action),
            RecordedEvent {
                hook: "error",
                action: event.action.to_string(),
                args: event.args.clone(),
                operation_id: Some(event.operation_id.to_string()),
                phase: None,
                before: event.before.clone(),
                after: Some(event.after.clone()),
            },
        );
    }

    fn on_abort(&self, event: &AbortEvent<'_, S>) {
        self.record(
            format!("abort:{}#{}", event.action, event.operation_id),
            RecordedEvent {
                hook: "abort",
                action: event.action.to_string(),
                args: event.args.clone(),
                operation_id: Some(event.operation_id.to_string()),
                phase: None,
                before: event.before.clone(),
                after: Some(event.after.clone()),
            },
        );
    }

    fn on_rollback(&self, event: &RollbackEvent<'_, S>) {
        self.record(
            format!("rollback:{}", event.action),
            RecordedEvent {
                hook: "rollback",
                action: event.action.to_string(),
                args: event.args.clone(),
                operation_id: Some(event.operation_id.to_string()),
                phase: None,
                before: event.before.clone(),
                after: Some(event.restored.clone()),
            },
        );
    }
}
