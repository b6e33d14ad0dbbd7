//! Middleware - observe and gate the action lifecycle.
//!
//! Middleware sees every call before it is admitted, every committed effect,
//! and every failure, abort and rollback. Only `on_dispatch` can influence
//! the outcome (by halting a call); every other hook is observation.
//!
//! # Execution Order
//!
//! ```text
//! call
//!  → on_dispatch (each middleware, in registration order; first Halt wins)
//!  → conflict resolution
//!  → effects → on_effect (after each commit)
//!  → on_rollback (failed or aborted invocation with an optimistic update)
//!  → on_error / on_abort (after the settlement committed)
//! ```
//!
//! Hooks run on the dispatch loop: keep them cheap. A panicking hook is
//! logged and treated as `Flow::Continue`.
//!
//! # Example
//!
//! ```ignore
//! struct ReadOnly;
//!
//! impl<S: State> Middleware<S> for ReadOnly {
//!     fn name(&self) -> &str {
//!         "read_only"
//!     }
//!
//!     fn on_dispatch(&self, event: &DispatchEvent<'_, S>) -> Flow {
//!         if event.action.starts_with("save") {
//!             Flow::halt("store is read-only")
//!         } else {
//!             Flow::Continue
//!         }
//!     }
//! }
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::core::{extract_panic_message, ActionArgs, State};
use crate::error::{ActionError, EffectPhase};

/// Whether a call may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Let the call through.
    Continue,
    /// Stop the call. The caller gets `ActionOutcome::Blocked`.
    Halt {
        /// Why the call was stopped (logged).
        reason: String,
    },
}

impl Flow {
    /// Convenience constructor for `Flow::Halt`.
    pub fn halt(reason: impl Into<String>) -> Self {
        Flow::Halt {
            reason: reason.into(),
        }
    }
}

/// A call about to be admitted.
pub struct DispatchEvent<'a, S> {
    /// Action name.
    pub action: &'a str,
    /// The call's arguments.
    pub args: &'a ActionArgs,
    /// Committed state at the time of the call.
    pub state: &'a Arc<S>,
}

/// An effect that just committed.
pub struct EffectEvent<'a, S> {
    /// Action name.
    pub action: &'a str,
    /// The call's arguments.
    pub args: &'a ActionArgs,
    /// Which effect ran.
    pub phase: EffectPhase,
    /// State before the effect.
    pub before: &'a Arc<S>,
    /// State after the effect (now committed).
    pub after: &'a Arc<S>,
}

/// An async invocation that failed and has settled.
pub struct ErrorEvent<'a, S> {
    /// Action name.
    pub action: &'a str,
    /// The call's arguments.
    pub args: &'a ActionArgs,
    /// Operation id of the failed invocation.
    pub operation_id: &'a str,
    /// The failure.
    pub error: &'a ActionError,
    /// Committed state when the failure arrived.
    pub before: &'a Arc<S>,
    /// Committed state after rollback and the error effect.
    pub after: &'a Arc<S>,
}

/// An async invocation that was aborted and has settled.
pub struct AbortEvent<'a, S> {
    /// Action name.
    pub action: &'a str,
    /// The call's arguments.
    pub args: &'a ActionArgs,
    /// Operation id of the aborted invocation.
    pub operation_id: &'a str,
    /// Committed state when the abort arrived.
    pub before: &'a Arc<S>,
    /// Committed state after rollback and the error effect.
    pub after: &'a Arc<S>,
}

/// An optimistic update that was just reverted.
pub struct RollbackEvent<'a, S> {
    /// Action name.
    pub action: &'a str,
    /// The call's arguments.
    pub args: &'a ActionArgs,
    /// Operation id of the invocation being rolled back.
    pub operation_id: &'a str,
    /// Committed state before the rollback.
    pub before: &'a Arc<S>,
    /// State with this invocation's optimistic effect removed. Transitions
    /// committed since the optimistic effect are still applied.
    pub restored: &'a Arc<S>,
}

/// Lifecycle hooks around action execution.
///
/// Every method has a no-op default; implement only what you need.
pub trait Middleware<S>: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called before conflict resolution. Return `Flow::Halt` to stop the call.
    fn on_dispatch(&self, _event: &DispatchEvent<'_, S>) -> Flow {
        Flow::Continue
    }

    /// Called after an effect committed.
    fn on_effect(&self, _event: &EffectEvent<'_, S>) {}

    /// Called after a failed async invocation settled (never for aborts).
    fn on_error(&self, _event: &ErrorEvent<'_, S>) {}

    /// Called after an aborted invocation settled.
    fn on_abort(&self, _event: &AbortEvent<'_, S>) {}

    /// Called when an optimistic update is reverted.
    fn on_rollback(&self, _event: &RollbackEvent<'_, S>) {}

    /// Return true to make the store journal transitions while optimistic
    /// updates are outstanding, so that failed invocations can be rolled back.
    fn tracks_optimistic(&self) -> bool {
        false
    }
}

// =============================================================================
// Chain
// =============================================================================

/// Ordered list of middleware, invoked by the dispatch loop.
pub(crate) struct MiddlewareChain<S> {
    middlewares: Vec<Arc<dyn Middleware<S>>>,
}

impl<S: State> MiddlewareChain<S> {
    pub fn new(middlewares: Vec<Arc<dyn Middleware<S>>>) -> Self {
        Self { middlewares }
    }

    fn each(&self, hook: &str, mut f: impl FnMut(&dyn Middleware<S>)) {
        for m in &self.middlewares {
            if let Err(panic_info) = catch_unwind(AssertUnwindSafe(|| f(m.as_ref()))) {
                error!(
                    middleware = m.name(),
                    hook,
                    panic = %extract_panic_message(&panic_info),
                    "middleware panicked"
                );
            }
        }
    }

    pub fn dispatch(&self, event: &DispatchEvent<'_, S>) -> Flow {
        for m in &self.middlewares {
            match catch_unwind(AssertUnwindSafe(|| m.on_dispatch(event))) {
                Ok(Flow::Continue) => {}
                Ok(halt @ Flow::Halt { .. }) => {
                    debug!(middleware = m.name(), action = event.action, "call halted");
                    return halt;
                }
                Err(panic_info) => {
                    error!(
                        middleware = m.name(),
                        hook = "on_dispatch",
                        panic = %extract_panic_message(&panic_info),
                        "middleware panicked"
                    );
                }
            }
        }
        Flow::Continue
    }

    pub fn effect(&self, event: &EffectEvent<'_, S>) {
        self.each("on_effect", |m| m.on_effect(event));
    }

    pub fn error(&self, event: &ErrorEvent<'_, S>) {
        self.each("on_error", |m| m.on_error(event));
    }

    pub fn abort(&self, event: &AbortEvent<'_, S>) {
        self.each("on_abort", |m| m.on_abort(event));
    }

    pub fn rollback(&self, event: &RollbackEvent<'_, S>) {
        self.each("on_rollback", |m| m.on_rollback(event));
    }

    pub fn tracks_optimistic(&self) -> bool {
        self.middlewares.iter().any(|m| m.tracks_optimistic())
    }
}

/// Lets callers keep a handle to middleware they install (e.g. to read
/// `OptimisticMiddleware::rollbacks`).
impl<S, M: Middleware<S>> Middleware<S> for Arc<M> {
    fn name(&self) -> &str {
        self.as_ref().name()
    }

    fn on_dispatch(&self, event: &DispatchEvent<'_, S>) -> Flow {
        self.as_ref().on_dispatch(event)
    }

    fn on_effect(&self, event: &EffectEvent<'_, S>) {
        self.as_ref().on_effect(event)
    }

    fn on_error(&self, event: &ErrorEvent<'_, S>) {
        self.as_ref().on_error(event)
    }

    fn on_abort(&self, event: &AbortEvent<'_, S>) {
        self.as_ref().on_abort(event)
    }

    fn on_rollback(&self, event: &RollbackEvent<'_, S>) {
        self.as_ref().on_rollback(event)
    }

    fn tracks_optimistic(&self) -> bool {
        self.as_ref().tracks_optimistic()
    }
}

// =============================================================================
// Built-in middleware
// =============================================================================

/// Enables rollback of optimistic updates.
///
/// Without this middleware optimistic effects are applied but never
/// reverted when the operation fails.
#[derive(Debug, Default)]
pub struct OptimisticMiddleware {
    rollbacks: AtomicUsize,
}

impl OptimisticMiddleware {
    /// Create the middleware.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many rollbacks have happened so far.
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::Relaxed)
    }
}

impl<S: State> Middleware<S> for OptimisticMiddleware {
    fn name(&self) -> &str {
        "optimistic"
    }

    fn on_rollback(&self, event: &RollbackEvent<'_, S>) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        debug!(action = event.action, operation_id = event.operation_id, "optimistic update rolled back");
    }

    fn tracks_optimistic(&self) -> bool {
        true
    }
}

/// Logs every lifecycle event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingMiddleware;

impl<S: State> Middleware<S> for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_dispatch(&self, event: &DispatchEvent<'_, S>) -> Flow {
        debug!(action = event.action, args = event.args.type_name(), "dispatch");
        Flow::Continue
    }

    fn on_effect(&self, event: &EffectEvent<'_, S>) {
        debug!(
            action = event.action,
            args = event.args.type_name(),
            phase = %event.phase,
            changed = !Arc::ptr_eq(event.before, event.after),
            "effect committed"
        );
    }

    fn on_error(&self, event: &ErrorEvent<'_, S>) {
        warn!(
            action = event.action,
            operation_id = event.operation_id,
            error = %event.error,
            changed = !Arc::ptr_eq(event.before, event.after),
            "action failed"
        );
    }

    fn on_abort(&self, event: &AbortEvent<'_, S>) {
        info!(action = event.action, operation_id = event.operation_id, "action aborted");
    }

    fn on_rollback(&self, event: &RollbackEvent<'_, S>) {
        info!(action = event.action, operation_id = event.operation_id, "optimistic update rolled back");
    }
}
