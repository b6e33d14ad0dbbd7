//! Effect pipeline: pure state transitions and the side effects that follow them.
//!
//! Effects are functions that compute the next state from the current one.
//! They never see a half-applied state and never publish one:
//!
//! ```text
//! committed Arc<S> ──clone──► draft ──effect(&mut draft)──► Ok  ──► commit
//!                                                       └─► Err ──► discard draft
//! ```
//!
//! # Key Properties
//!
//! - **Drafts are private**: an effect mutates its own clone of the state
//! - **All or nothing**: a returned error or a panic discards the draft
//! - **Side effects run after commit**: they see the committed state and can
//!   only enqueue further actions, never mutate state directly

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, warn};

use crate::core::{extract_panic_message, ActionArgs, ActionValue, State};
use crate::error::{ActionError, EffectPhase, StoreError};
use crate::store::Actions;

/// Return type accepted from effect and side-effect functions.
///
/// Lets simple effects return `()` while fallible ones return a `Result`.
///
/// ```ignore
/// a.sync(|state, by: &i64, _| state.count += *by);
/// a.sync(|state, name: &String, _| -> anyhow::Result<()> {
///     anyhow::ensure!(!name.is_empty(), "name required");
///     state.name = name.clone();
///     Ok(())
/// });
/// ```
pub trait EffectReturn {
    /// Convert into the engine's result type.
    fn into_effect_result(self) -> Result<()>;
}

impl EffectReturn for () {
    fn into_effect_result(self) -> Result<()> {
        Ok(())
    }
}

impl<E> EffectReturn for std::result::Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_effect_result(self) -> Result<()> {
        self.map_err(Into::into)
    }
}

/// Run an effect against a private draft of `base`.
///
/// Returns the draft if the effect succeeded. Errors and panics are converted
/// into [`StoreError`] and the draft is dropped, so the caller keeps the last
/// committed state.
pub(crate) fn apply_effect<S, F>(
    action: &str,
    phase: EffectPhase,
    base: &S,
    effect: F,
) -> std::result::Result<S, StoreError>
where
    S: State,
    F: FnOnce(&mut S) -> Result<()>,
{
    let mut draft = base.clone();
    match catch_unwind(AssertUnwindSafe(|| effect(&mut draft))) {
        Ok(Ok(())) => Ok(draft),
        Ok(Err(e)) => {
            warn!(action, %phase, error = %e, "effect failed, nothing committed");
            Err(StoreError::Effect {
                action: action.to_string(),
                phase,
                cause: Arc::new(e),
            })
        }
        Err(panic_info) => {
            let message = extract_panic_message(&panic_info);
            error!(action, %phase, panic = %message, "effect panicked, nothing committed");
            Err(StoreError::EffectPanicked {
                action: action.to_string(),
                phase,
                message,
            })
        }
    }
}

// =============================================================================
// Side Effects
// =============================================================================

/// Context handed to side-effect functions.
///
/// Side effects run after the effect of the same invocation has committed.
/// They read the committed state and may dispatch further actions through
/// [`SideEffectContext::actions`]; those calls are queued behind the current
/// transition rather than executed recursively.
pub struct SideEffectContext<'a, S, P, A> {
    action: &'a str,
    args: &'a A,
    state: &'a Arc<S>,
    props: &'a P,
    actions: &'a Actions<S, P>,
}

impl<'a, S, P, A> SideEffectContext<'a, S, P, A> {
    /// The action this side effect belongs to.
    pub fn action(&self) -> &str {
        self.action
    }

    /// The arguments of the invocation.
    pub fn args(&self) -> &A {
        self.args
    }

    /// The committed state at the time the side effect runs.
    pub fn state(&self) -> &Arc<S> {
        self.state
    }

    /// The store's current props.
    pub fn props(&self) -> &P {
        self.props
    }

    /// Handle for dispatching further actions.
    pub fn actions(&self) -> &Actions<S, P> {
        self.actions
    }
}

/// What the invocation produced, carried to its side effect.
#[derive(Clone, Debug)]
pub(crate) enum SidePayload {
    None,
    Value(ActionValue),
    Error(ActionError),
}

/// Type-erased side effect as stored in descriptors.
pub(crate) type ErasedSideEffect<S, P> =
    Arc<dyn Fn(&SideEffectEnv<'_, S, P>) -> Result<()> + Send + Sync>;

/// Everything a type-erased side effect needs at run time.
pub(crate) struct SideEffectEnv<'a, S, P> {
    pub action: &'a str,
    pub args: &'a ActionArgs,
    pub payload: &'a SidePayload,
    pub state: &'a Arc<S>,
    pub props: &'a P,
    pub actions: &'a Actions<S, P>,
}

impl<'a, S, P> SideEffectEnv<'a, S, P> {
    /// Build the typed context for a side effect taking arguments `A`.
    pub fn typed<A: 'static>(&self) -> Result<SideEffectContext<'a, S, P, A>> {
        let args = self.args.downcast_ref::<A>().ok_or_else(|| {
            anyhow::anyhow!(
                "side effect of `{}` expected arguments of type {}",
                self.action,
                std::any::type_name::<A>()
            )
        })?;
        Ok(SideEffectContext {
            action: self.action,
            args,
            state: self.state,
            props: self.props,
            actions: self.actions,
        })
    }
}

/// A side effect bound to the invocation that triggered it, ready to run
/// now or when a debounce timer fires.
pub(crate) struct PendingSideEffect<S, P> {
    pub action: Arc<str>,
    pub args: ActionArgs,
    pub payload: SidePayload,
    pub run: ErasedSideEffect<S, P>,
}

impl<S, P> PendingSideEffect<S, P> {
    /// Run against the current committed state.
    ///
    /// Errors and panics are logged and do not affect the store: the
    /// transition that triggered the side effect has already committed.
    pub fn run(self, state: &Arc<S>, props: &P, actions: &Actions<S, P>) {
        let env = SideEffectEnv {
            action: &self.action,
            args: &self.args,
            payload: &self.payload,
            state,
            props,
            actions,
        };
        match catch_unwind(AssertUnwindSafe(|| (self.run)(&env))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(action = %self.action, error = %e, "side effect failed");
            }
            Err(panic_info) => {
                error!(
                    action = %self.action,
                    panic = %extract_panic_message(&panic_info),
                    "side effect panicked"
                );
            }
        }
    }
}
