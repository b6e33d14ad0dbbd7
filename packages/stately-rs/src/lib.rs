//! # Stately
//!
//! A reactive state store where actions decide, operations execute, and one
//! dispatch loop commits every snapshot.
//!
//! ## Core Concepts
//!
//! A [`Store`] holds one state value. The state is never mutated in place:
//! every change is a named action whose effect turns the current state into
//! the next one, committed as a new immutable [`Snapshot`].
//!
//! - **Sync actions** are pure transforms of `(state, args, props)`
//! - **Async actions** wrap an operation (any future) with effects for each
//!   stage of its life: before it starts, while it runs, when it succeeds,
//!   when it fails or is aborted
//!
//! The key principle: **one dispatch loop per store**. Calls, operation
//! completions, aborts and timers are all messages to that loop, so effects
//! never race and observers never see a half-applied transition.
//!
//! ## Architecture
//!
//! ```text
//! Actions::call(name, args)
//!     │
//!     ▼ mailbox
//! Dispatcher loop ─► Middleware.on_dispatch ─► Debounce ─► ConflictResolver
//!     ▲                                                        │
//!     │                                       pre_effect ◄─────┘
//!     │                                       optimistic
//!     │                                           │
//!     │                                     tokio::spawn(operation)
//!     │                                           │
//!     └──────────── Message::Settled ◄────────────┘
//!                          │
//!                          ▼
//!              effect / error_effect ─► commit ─► DerivedEngine
//!                                                     │
//!                                                     ▼
//!                                        ObserverRegistry.publish
//!                                                     │
//!                                                     ▼
//!                                         side effects (may call actions)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Snapshots are complete** - observers only ever see committed values
//! 2. **One active invocation per slot** - a slot is `(action, operation id)`
//! 3. **Failed effects commit nothing** - a returned error or a panic keeps
//!    the last committed state
//! 4. **Aborts are quiet** - they run the error path but never reach the
//!    Error Map or the error notifier
//! 5. **Side effects never recurse** - actions they call are queued behind
//!    the current transition
//! 6. **Rollback is per invocation** - a failed optimistic update is removed
//!    and everything committed after it is replayed
//!
//! ## Conflict policies
//!
//! | Policy     | Call while the slot is busy                          |
//! |------------|------------------------------------------------------|
//! | `KeepAll`  | queued, runs in call order (default)                 |
//! | `KeepLast` | replaces any queued call; replaced callers superseded |
//! | `Ignore`   | dropped                                              |
//! | `Reject`   | `StoreError::Conflict`                               |
//! | `Parallel` | slot keyed by operation id; same id queues           |
//!
//! ## Example
//!
//! ```ignore
//! use stately::{ConflictPolicy, DerivedDescriptor, Store};
//!
//! #[derive(Clone, Default, serde::Serialize)]
//! struct Todos {
//!     items: Vec<String>,
//!     saving: bool,
//! }
//!
//! let store = Store::builder(Todos::default)
//!     .name("todos")
//!     .action("add", |a| a.sync(|s, item: &String, _| s.items.push(item.clone())))
//!     .action("save", |a| {
//!         a.asynchronous(|items: Vec<String>, ctx| async move { api::save(&items, ctx.cancellation_token()).await })
//!             .pre_effect(|s, _, _| s.saving = true)
//!             .effect(|s, _, _saved: &(), _| s.saving = false)
//!             .error_effect(|s, _, _err, _| s.saving = false)
//!             .policy(ConflictPolicy::KeepLast)
//!             .abortable()
//!     })
//!     .derived(DerivedDescriptor::new("count", |s: &Todos, _| s.items.len(), |n| *n))
//!     .build()?;
//!
//! let _sub = store.subscribe_keys(["count"], |sel| println!("{:?}", sel.derived::<usize>("count")))?;
//! store.actions().call("add", "milk".to_string()).await?;
//! ```
//!
//! ## What This Is Not
//!
//! Stately is **not**:
//! - A persistence layer (state lives in memory only)
//! - A multi-process synchronization tool
//! - A UI framework
//!
//! Stately **is**:
//! > A reactive state store where actions decide, operations execute, and
//! > one dispatch loop commits every snapshot.

// Core modules
mod action;
mod config;
mod conflict;
mod core;
mod derived;
mod dispatch;
mod effect;
mod error;
mod inflight;
mod journal;
mod middleware;
mod scheduler;
mod snapshot;
mod store;
mod subscription;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use crate::core::{ActionArgs, ActionValue, InvocationId, Props, State, StoreId, DEFAULT_OPERATION_ID};

// Re-export error types
pub use crate::error::{ActionError, EffectPhase, StoreError};

// Re-export action descriptor types
pub use action::{
    ActionDescriptor, ActionFactory, AdvancedSyncAction, AdvancedSyncBuilder, AsyncAction, AsyncBuilder,
    DebounceSettings, Operation, OperationContext, SyncAction,
};

// Re-export effect types
pub use effect::{EffectReturn, SideEffectContext};

// Re-export conflict resolution types
pub use conflict::{Admission, ConflictPolicy, ConflictResolver, Decision, SlotKey};

// Re-export debounce types
pub use scheduler::{DebounceKey, DebounceKind};

// Re-export snapshot types
pub use snapshot::{ErrorMap, ErrorRecord, LoadingMap, Snapshot};

// Re-export derived state types
pub use derived::{DerivedDescriptor, DerivedValues};

// Re-export subscription types
pub use subscription::{KeySelection, SelectedValue, Subscription, ERROR_KEY_PREFIX, LOADING_KEY_PREFIX};

// Re-export middleware types
pub use middleware::{
    AbortEvent, DispatchEvent, EffectEvent, ErrorEvent, Flow, Middleware, OptimisticMiddleware, RollbackEvent,
    TracingMiddleware,
};

// Re-export configuration types
pub use config::{EngineConfig, ErrorNotifier, TracingNotifier, DEFAULT_IDLE_TIMEOUT};

// Re-export store types (primary entry point)
pub use store::{ActionCall, ActionOutcome, Actions, Store, StoreBuilder};

// Re-export activity tracking
pub use inflight::{ActivityGuard, ActivityTracker};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
