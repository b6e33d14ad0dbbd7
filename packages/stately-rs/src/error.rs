//! Structured error types for stores and actions.
//!
//! `StoreError` is what a caller of the store can get back: configuration
//! problems at build time, conflicts, effect failures, and lifecycle errors.
//! `ActionError` is what an async action's error effect and the Error Map
//! see: either the operation failed or it was aborted.
//!
//! # The Error Boundary Rule
//!
//! > **User code speaks `anyhow`; the store speaks `StoreError` and `ActionError`.**
//!
//! - Operations and effects return `anyhow::Result` (ergonomic for callers)
//! - The engine wraps those into pattern-matchable variants before they leave
//!   the dispatch loop
//!
//! # Example
//!
//! ```ignore
//! use stately::{ActionOutcome, StoreError};
//!
//! match store.actions().call("save", draft).await {
//!     Ok(ActionOutcome::Completed(value)) => println!("saved {:?}", value),
//!     Ok(ActionOutcome::Failed(err)) => eprintln!("save failed: {}", err),
//!     Err(StoreError::Conflict { action, .. }) => eprintln!("{} already running", action),
//!     Err(other) => eprintln!("store error: {}", other),
//!     Ok(_) => {}
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Effect Phase
// =============================================================================

/// Which effect function of an action was running.
///
/// Used in [`StoreError::Effect`] and in middleware transition events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectPhase {
    /// The transform of a synchronous action, or the effect of an advanced one.
    Sync,
    /// Runs before the operation starts; commits an interim snapshot.
    PreEffect,
    /// Runs when the operation starts; reverted on failure when tracked.
    Optimistic,
    /// Runs when the operation succeeds.
    Success,
    /// Runs when the operation fails or is aborted.
    Error,
}

impl fmt::Display for EffectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectPhase::Sync => write!(f, "sync"),
            EffectPhase::PreEffect => write!(f, "pre_effect"),
            EffectPhase::Optimistic => write!(f, "optimistic"),
            EffectPhase::Success => write!(f, "success"),
            EffectPhase::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Action Error
// =============================================================================

/// Terminal failure of an async action.
///
/// Cheap to clone: the underlying `anyhow::Error` is shared. Two values are
/// equal only if they are the same failure (or both aborts of the same action).
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// The operation returned an error (or panicked).
    #[error("action `{action}` failed: {cause}")]
    Failed {
        /// The action name.
        action: String,
        /// The error returned by the operation.
        cause: Arc<anyhow::Error>,
    },

    /// The invocation was aborted before it settled.
    #[error("action `{action}` was aborted")]
    Aborted {
        /// The action name.
        action: String,
    },
}

impl ActionError {
    pub(crate) fn failed(action: &str, err: anyhow::Error) -> Self {
        ActionError::Failed {
            action: action.to_string(),
            cause: Arc::new(err),
        }
    }

    pub(crate) fn aborted(action: &str) -> Self {
        ActionError::Aborted {
            action: action.to_string(),
        }
    }

    /// The name of the action that produced this error.
    pub fn action(&self) -> &str {
        match self {
            ActionError::Failed { action, .. } | ActionError::Aborted { action } => action,
        }
    }

    /// Returns true if this is the abort-kind error.
    pub fn is_abort(&self) -> bool {
        matches!(self, ActionError::Aborted { .. })
    }

    /// The operation's error, if this is a failure.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            ActionError::Failed { cause, .. } => Some(cause.as_ref()),
            ActionError::Aborted { .. } => None,
        }
    }
}

impl PartialEq for ActionError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                ActionError::Failed { action: a, cause: x },
                ActionError::Failed { action: b, cause: y },
            ) => a == b && Arc::ptr_eq(x, y),
            (ActionError::Aborted { action: a }, ActionError::Aborted { action: b }) => a == b,
            _ => false,
        }
    }
}

// =============================================================================
// Store Error
// =============================================================================

/// Errors returned by the store to its callers.
///
/// Configuration variants come out of `StoreBuilder::build()`; the rest come
/// back from `Actions::call` or store methods.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No action with this name is registered.
    #[error("no action registered with name `{action}`")]
    UnknownAction {
        /// The requested name.
        action: String,
    },

    /// Two descriptors were registered under the same name.
    #[error("action `{action}` is registered more than once")]
    DuplicateAction {
        /// The duplicated name.
        action: String,
    },

    /// An action or derived value was registered with an empty name.
    #[error("action and derived state names must not be empty")]
    EmptyName,

    /// An action descriptor is malformed.
    #[error("invalid descriptor for action `{action}`: {reason}")]
    InvalidDescriptor {
        /// The action name.
        action: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Two derived descriptors share a name.
    #[error("derived state `{name}` is registered more than once")]
    DuplicateDerived {
        /// The duplicated name.
        name: String,
    },

    /// A derived value and an action share a name, making key selection ambiguous.
    #[error("`{name}` is used both as an action and a derived state name")]
    NameCollision {
        /// The shared name.
        name: String,
    },

    /// `build()` was called outside a tokio runtime.
    #[error("stores must be built inside a tokio runtime")]
    NoRuntime,

    /// The arguments passed to an action have the wrong type.
    #[error("action `{action}` expects arguments of type {expected}")]
    ArgumentTypeMismatch {
        /// The action name.
        action: String,
        /// The type the descriptor was registered with.
        expected: &'static str,
    },

    /// A call collided with an active invocation under the `Reject` policy.
    #[error("action `{action}` is already running (operation id `{operation_id}`)")]
    Conflict {
        /// The action name.
        action: String,
        /// The slot that was busy.
        operation_id: String,
    },

    /// An effect function returned an error. Nothing was committed.
    #[error("{phase} effect of action `{action}` failed: {cause}")]
    Effect {
        /// The action name.
        action: String,
        /// Which effect failed.
        phase: EffectPhase,
        /// The returned error.
        cause: Arc<anyhow::Error>,
    },

    /// An effect function panicked. Nothing was committed.
    #[error("{phase} effect of action `{action}` panicked: {message}")]
    EffectPanicked {
        /// The action name.
        action: String,
        /// Which effect panicked.
        phase: EffectPhase,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// The operation id function of a parallel action panicked.
    #[error("operation id of action `{action}` could not be computed: {message}")]
    OperationId {
        /// The action name.
        action: String,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A key passed to `subscribe_keys` names nothing in the store.
    #[error("selector key `{key}` names no state field, derived value, action, or action loading/error entry")]
    UnknownSelectorKey {
        /// The unknown key.
        key: String,
    },

    /// The store has been disposed.
    #[error("store has been disposed")]
    Disposed,

    /// Timeout waiting for the store to become idle.
    #[error("store did not become idle within {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },
}

impl StoreError {
    /// Returns true for errors raised by `StoreBuilder::build()`.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StoreError::DuplicateAction { .. }
                | StoreError::EmptyName
                | StoreError::InvalidDescriptor { .. }
                | StoreError::DuplicateDerived { .. }
                | StoreError::NameCollision { .. }
                | StoreError::NoRuntime
        )
    }
}
