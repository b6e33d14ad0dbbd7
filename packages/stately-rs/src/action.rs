//! Action descriptors - what an action does, declared up front.
//!
//! Actions come in three kinds:
//!
//! | Kind           | Runs                                  | Produces             |
//! |----------------|---------------------------------------|----------------------|
//! | `Sync`         | one pure transform                    | the committed state  |
//! | `AdvancedSync` | an effect, then a side effect         | the committed state  |
//! | `Async`        | an operation wrapped in effects       | the operation result |
//!
//! Descriptors are built with an [`ActionFactory`] handed to
//! `StoreBuilder::action`, so closure argument types are inferred from the
//! store's state and props types:
//!
//! ```ignore
//! Store::builder(Counter::default)
//!     .action("add", |a| a.sync(|state, by: &i64, _props| state.count += *by))
//!     .action("load", |a| {
//!         a.asynchronous(|id: u32, ctx| async move { api::fetch(id, ctx.cancellation_token()).await })
//!             .pre_effect(|state, _id, _| state.status = Status::Loading)
//!             .effect(|state, _id, item, _| state.item = Some(item.clone()))
//!             .error_effect(|state, _id, err, _| state.status = Status::Failed(err.to_string()))
//!             .policy(ConflictPolicy::KeepLast)
//!             .abortable()
//!     })
//!     .build()?;
//! ```
//!
//! Async actions go through the whole lifecycle:
//!
//! ```text
//! call → pre_effect (commit) → optimistic (commit) → operation
//!                                                   ├─ Ok  → effect       → side_effect
//!                                                   └─ Err → error_effect → error_side_effect
//! ```

use std::any::{type_name, TypeId};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::conflict::ConflictPolicy;
use crate::core::{ActionArgs, ActionValue, Props, State, DEFAULT_OPERATION_ID};
use crate::effect::{EffectReturn, ErasedSideEffect, SideEffectContext, SideEffectEnv, SidePayload};
use crate::error::{ActionError, StoreError};

// =============================================================================
// Erased function types
// =============================================================================

pub(crate) type ErasedEffect<S, P> =
    Arc<dyn Fn(&mut S, &ActionArgs, &P) -> Result<()> + Send + Sync>;

pub(crate) type ErasedSuccessEffect<S, P> =
    Arc<dyn Fn(&mut S, &ActionArgs, &ActionValue, &P) -> Result<()> + Send + Sync>;

pub(crate) type ErasedErrorEffect<S, P> =
    Arc<dyn Fn(&mut S, &ActionArgs, &ActionError, &P) -> Result<()> + Send + Sync>;

pub(crate) type ErasedOperation<S, P> = Arc<
    dyn Fn(&ActionArgs, OperationContext<S, P>) -> BoxFuture<'static, Result<ActionValue>>
        + Send
        + Sync,
>;

pub(crate) type ErasedOperationId = Arc<dyn Fn(&ActionArgs) -> String + Send + Sync>;

fn downcast<'a, A: 'static>(action: &str, args: &'a ActionArgs) -> Result<&'a A> {
    args.downcast_ref::<A>().ok_or_else(|| {
        anyhow::anyhow!(
            "action `{}` expected arguments of type {}, got {}",
            action,
            type_name::<A>(),
            args.type_name()
        )
    })
}

fn effect_fn<S, P, F>(f: F) -> ErasedEffect<S, P>
where
    F: Fn(&mut S, &ActionArgs, &P) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn side_effect_fn<S, P, F>(f: F) -> ErasedSideEffect<S, P>
where
    F: Fn(&SideEffectEnv<'_, S, P>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn operation_fn<S, P, F>(f: F) -> ErasedOperation<S, P>
where
    F: Fn(&ActionArgs, OperationContext<S, P>) -> BoxFuture<'static, Result<ActionValue>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Wrap a typed `(state, args, props)` effect.
fn erase_effect<S, P, A, F, Ret>(action: Arc<str>, f: F) -> ErasedEffect<S, P>
where
    S: State,
    P: Props,
    A: Send + Sync + 'static,
    F: Fn(&mut S, &A, &P) -> Ret + Send + Sync + 'static,
    Ret: EffectReturn,
{
    effect_fn(move |state: &mut S, args: &ActionArgs, props: &P| {
        f(state, downcast::<A>(&action, args)?, props).into_effect_result()
    })
}

// =============================================================================
// Descriptor parts
// =============================================================================

/// The argument type an action was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArgsSpec {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl ArgsSpec {
    pub fn of<A: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<A>(),
            type_name: type_name::<A>(),
        }
    }

    pub fn accepts(&self, type_id: TypeId) -> bool {
        self.type_id == type_id
    }
}

/// Debounce settings of an action. Both are trailing-edge, latest call wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebounceSettings {
    /// Delay the whole invocation.
    pub invocation: Option<Duration>,
    /// Commit immediately, delay only the side effect.
    pub side_effects: Option<Duration>,
}

/// A pure transform.
pub struct SyncAction<S, P> {
    pub(crate) args: ArgsSpec,
    pub(crate) transform: ErasedEffect<S, P>,
}

/// An effect followed by a side effect.
pub struct AdvancedSyncAction<S, P> {
    pub(crate) args: ArgsSpec,
    pub(crate) effect: ErasedEffect<S, P>,
    pub(crate) side_effect: Option<ErasedSideEffect<S, P>>,
    pub(crate) debounce: DebounceSettings,
}

/// An operation with its effects and concurrency rules.
pub struct AsyncAction<S, P> {
    pub(crate) args: ArgsSpec,
    pub(crate) operation: ErasedOperation<S, P>,
    pub(crate) pre_effect: Option<ErasedEffect<S, P>>,
    pub(crate) optimistic: Option<ErasedEffect<S, P>>,
    pub(crate) on_success: Option<ErasedSuccessEffect<S, P>>,
    pub(crate) on_error: Option<ErasedErrorEffect<S, P>>,
    pub(crate) side_effect: Option<ErasedSideEffect<S, P>>,
    pub(crate) error_side_effect: Option<ErasedSideEffect<S, P>>,
    pub(crate) policy: Option<ConflictPolicy>,
    pub(crate) operation_id: Option<ErasedOperationId>,
    pub(crate) abortable: bool,
    pub(crate) debounce: DebounceSettings,
    pub(crate) error_managed: bool,
}

impl<S, P> AsyncAction<S, P> {
    /// The policy in effect, given the engine default.
    pub(crate) fn effective_policy(&self, default: ConflictPolicy) -> ConflictPolicy {
        self.policy.unwrap_or(default)
    }
}

/// Declaration of one action.
pub enum ActionDescriptor<S, P> {
    /// Pure transform of (state, args, props).
    Sync(SyncAction<S, P>),
    /// Effect plus side effect, with debounce settings.
    AdvancedSync(AdvancedSyncAction<S, P>),
    /// Operation wrapped with conflict, optimism, abort and debounce handling.
    Async(AsyncAction<S, P>),
}

impl<S, P> ActionDescriptor<S, P> {
    pub(crate) fn args(&self) -> &ArgsSpec {
        match self {
            ActionDescriptor::Sync(a) => &a.args,
            ActionDescriptor::AdvancedSync(a) => &a.args,
            ActionDescriptor::Async(a) => &a.args,
        }
    }

    pub(crate) fn debounce(&self) -> DebounceSettings {
        match self {
            ActionDescriptor::Sync(_) => DebounceSettings::default(),
            ActionDescriptor::AdvancedSync(a) => a.debounce,
            ActionDescriptor::Async(a) => a.debounce,
        }
    }

    /// Short name of the descriptor kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionDescriptor::Sync(_) => "sync",
            ActionDescriptor::AdvancedSync(_) => "advanced_sync",
            ActionDescriptor::Async(_) => "async",
        }
    }

    /// Check the descriptor for contradictions.
    pub(crate) fn validate(&self, name: &str, default_policy: ConflictPolicy) -> Result<(), StoreError> {
        let invalid = |reason: &'static str| StoreError::InvalidDescriptor {
            action: name.to_string(),
            reason,
        };
        match self {
            ActionDescriptor::Sync(_) => Ok(()),
            ActionDescriptor::AdvancedSync(a) => {
                if a.debounce.side_effects.is_some() && a.side_effect.is_none() {
                    return Err(invalid("side effect debounce set without a side effect"));
                }
                Ok(())
            }
            ActionDescriptor::Async(a) => {
                let parallel = a.effective_policy(default_policy) == ConflictPolicy::Parallel;
                match (parallel, a.operation_id.is_some()) {
                    (true, false) => return Err(invalid("parallel policy requires an operation id function")),
                    (false, true) => return Err(invalid("operation id function requires the parallel policy")),
                    _ => {}
                }
                if a.debounce.side_effects.is_some()
                    && a.side_effect.is_none()
                    && a.error_side_effect.is_none()
                {
                    return Err(invalid("side effect debounce set without a side effect"));
                }
                Ok(())
            }
        }
    }
}

impl<S, P> From<SyncAction<S, P>> for ActionDescriptor<S, P> {
    fn from(action: SyncAction<S, P>) -> Self {
        ActionDescriptor::Sync(action)
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Everything an operation may look at while it runs.
///
/// The state is the committed state at the moment the operation started
/// (after pre-effect and optimistic effect).
pub struct OperationContext<S, P> {
    state: Arc<S>,
    props: Arc<P>,
    cancel: CancellationToken,
    action: Arc<str>,
    operation_id: Arc<str>,
}

impl<S, P> OperationContext<S, P> {
    pub(crate) fn new(
        state: Arc<S>,
        props: Arc<P>,
        cancel: CancellationToken,
        action: Arc<str>,
        operation_id: Arc<str>,
    ) -> Self {
        Self {
            state,
            props,
            cancel,
            action,
            operation_id,
        }
    }

    /// State when the operation started.
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    /// Props when the operation started.
    pub fn props(&self) -> &Arc<P> {
        &self.props
    }

    /// The action name.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// The operation id (the default id for non-parallel actions).
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Token cancelled when the invocation is aborted or the store disposed.
    ///
    /// Pass it to clients that support cancellation.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once the invocation has been aborted.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the invocation is aborted.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl<S, P> Clone for OperationContext<S, P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            props: self.props.clone(),
            cancel: self.cancel.clone(),
            action: self.action.clone(),
            operation_id: self.operation_id.clone(),
        }
    }
}

/// A struct-based async operation.
///
/// Useful when the operation carries its own clients or configuration:
///
/// ```ignore
/// struct FetchUser {
///     client: ApiClient,
/// }
///
/// #[async_trait]
/// impl Operation<Users, ()> for FetchUser {
///     type Args = UserId;
///     type Output = User;
///
///     async fn run(&self, id: UserId, _ctx: OperationContext<Users, ()>) -> Result<User> {
///         self.client.get_user(id).await
///     }
/// }
///
/// builder.action("fetch_user", |a| a.operation(FetchUser { client }).effect(...))
/// ```
#[async_trait]
pub trait Operation<S: State, P: Props>: Send + Sync + 'static {
    /// Arguments of the action.
    type Args: Clone + Send + Sync + 'static;
    /// Value produced on success.
    type Output: Send + Sync + 'static;

    /// Run the operation.
    async fn run(&self, args: Self::Args, ctx: OperationContext<S, P>) -> Result<Self::Output>;
}

// =============================================================================
// Factory & builders
// =============================================================================

/// Entry point for building descriptors with inferred state and props types.
pub struct ActionFactory<S, P> {
    name: Arc<str>,
    _types: PhantomData<fn() -> (S, P)>,
}

impl<S: State, P: Props> ActionFactory<S, P> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            _types: PhantomData,
        }
    }

    /// A synchronous action: one transform of `(state, args, props)`.
    ///
    /// The transform may return `()` or `Result<(), E>`.
    pub fn sync<A, F, Ret>(self, transform: F) -> SyncAction<S, P>
    where
        A: Send + Sync + 'static,
        F: Fn(&mut S, &A, &P) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        SyncAction {
            args: ArgsSpec::of::<A>(),
            transform: erase_effect(self.name, transform),
        }
    }

    /// A synchronous action with a side effect and debounce settings.
    pub fn advanced<A, F, Ret>(self, effect: F) -> AdvancedSyncBuilder<S, P, A>
    where
        A: Send + Sync + 'static,
        F: Fn(&mut S, &A, &P) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        AdvancedSyncBuilder {
            inner: AdvancedSyncAction {
                args: ArgsSpec::of::<A>(),
                effect: erase_effect(self.name.clone(), effect),
                side_effect: None,
                debounce: DebounceSettings::default(),
            },
            _args: PhantomData,
        }
    }

    /// An asynchronous action around an operation closure.
    ///
    /// The closure receives an owned copy of the arguments.
    pub fn asynchronous<A, R, F, Fut>(self, operation: F) -> AsyncBuilder<S, P, A, R>
    where
        A: Clone + Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(A, OperationContext<S, P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = self.name.clone();
        let erased = operation_fn(move |args: &ActionArgs, ctx: OperationContext<S, P>| {
            match downcast::<A>(&name, args) {
                Ok(args) => operation(args.clone(), ctx).map(|r| r.map(ActionValue::new)).boxed(),
                Err(e) => future::ready(Err(e)).boxed(),
            }
        });
        AsyncBuilder::new(self.name, erased)
    }

    /// An asynchronous action around an [`Operation`] implementation.
    pub fn operation<O>(self, operation: O) -> AsyncBuilder<S, P, O::Args, O::Output>
    where
        O: Operation<S, P>,
    {
        let operation = Arc::new(operation);
        let name = self.name.clone();
        let erased = operation_fn(move |args: &ActionArgs, ctx: OperationContext<S, P>| {
            match downcast::<O::Args>(&name, args) {
                Ok(args) => {
                    let operation = operation.clone();
                    let args = args.clone();
                    async move { operation.run(args, ctx).await.map(ActionValue::new) }.boxed()
                }
                Err(e) => future::ready(Err(e)).boxed(),
            }
        });
        AsyncBuilder::new(self.name, erased)
    }
}

/// Builder for [`AdvancedSyncAction`].
pub struct AdvancedSyncBuilder<S, P, A> {
    inner: AdvancedSyncAction<S, P>,
    _args: PhantomData<fn(A)>,
}

impl<S: State, P: Props, A: Send + Sync + 'static> AdvancedSyncBuilder<S, P, A> {
    /// Run after the effect commits. May dispatch further actions.
    pub fn side_effect<F, Ret>(mut self, f: F) -> Self
    where
        F: Fn(&SideEffectContext<'_, S, P, A>) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        self.inner.side_effect = Some(side_effect_fn(move |env: &SideEffectEnv<'_, S, P>| {
            f(&env.typed::<A>()?).into_effect_result()
        }));
        self
    }

    /// Delay the whole invocation; only the last call within the window runs.
    pub fn debounce(mut self, delay: Duration) -> Self {
        self.inner.debounce.invocation = Some(delay);
        self
    }

    /// Commit immediately but delay the side effect.
    pub fn debounce_side_effects(mut self, delay: Duration) -> Self {
        self.inner.debounce.side_effects = Some(delay);
        self
    }
}

impl<S, P, A> From<AdvancedSyncBuilder<S, P, A>> for ActionDescriptor<S, P> {
    fn from(builder: AdvancedSyncBuilder<S, P, A>) -> Self {
        ActionDescriptor::AdvancedSync(builder.inner)
    }
}

/// Builder for [`AsyncAction`].
pub struct AsyncBuilder<S, P, A, R> {
    name: Arc<str>,
    inner: AsyncAction<S, P>,
    _types: PhantomData<fn(A) -> R>,
}

impl<S, P, A, R> AsyncBuilder<S, P, A, R>
where
    S: State,
    P: Props,
    A: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn new(name: Arc<str>, operation: ErasedOperation<S, P>) -> Self {
        Self {
            name,
            inner: AsyncAction {
                args: ArgsSpec::of::<A>(),
                operation,
                pre_effect: None,
                optimistic: None,
                on_success: None,
                on_error: None,
                side_effect: None,
                error_side_effect: None,
                policy: None,
                operation_id: None,
                abortable: false,
                debounce: DebounceSettings::default(),
                error_managed: false,
            },
            _types: PhantomData,
        }
    }

    /// Runs before the operation starts and commits an interim state.
    pub fn pre_effect<F, Ret>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &A, &P) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        self.inner.pre_effect = Some(erase_effect(self.name.clone(), f));
        self
    }

    /// Applied when the operation starts.
    ///
    /// Reverted on failure only when an `OptimisticMiddleware` is installed.
    pub fn optimistic<F, Ret>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &A, &P) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        self.inner.optimistic = Some(erase_effect(self.name.clone(), f));
        self
    }

    /// Applied to the current state when the operation succeeds.
    pub fn effect<F, Ret>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &A, &R, &P) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        let name = self.name.clone();
        let erased: ErasedSuccessEffect<S, P> = Arc::new(
            move |state: &mut S, args: &ActionArgs, value: &ActionValue, props: &P| -> Result<()> {
                let result = value.downcast_ref::<R>().ok_or_else(|| {
                    anyhow::anyhow!("action `{}` produced {}, expected {}", name, value.type_name(), type_name::<R>())
                })?;
                f(state, downcast::<A>(&name, args)?, result, props).into_effect_result()
            },
        );
        self.inner.on_success = Some(erased);
        self
    }

    /// Applied when the operation fails or is aborted.
    ///
    /// Having an error effect means the action handles its own errors: they
    /// are still recorded but not sent to the error notifier.
    pub fn error_effect<F, Ret>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &A, &ActionError, &P) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        let name = self.name.clone();
        let erased: ErasedErrorEffect<S, P> = Arc::new(
            move |state: &mut S, args: &ActionArgs, error: &ActionError, props: &P| -> Result<()> {
                f(state, downcast::<A>(&name, args)?, error, props).into_effect_result()
            },
        );
        self.inner.on_error = Some(erased);
        self
    }

    /// Runs after the success effect commits. May dispatch further actions.
    pub fn side_effect<F, Ret>(mut self, f: F) -> Self
    where
        F: Fn(&SideEffectContext<'_, S, P, A>, &R) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        self.inner.side_effect = Some(side_effect_fn(move |env: &SideEffectEnv<'_, S, P>| {
            let ctx = env.typed::<A>()?;
            match env.payload {
                SidePayload::Value(value) => {
                    let result = value.downcast_ref::<R>().ok_or_else(|| {
                        anyhow::anyhow!("side effect of `{}` expected a {}", env.action, type_name::<R>())
                    })?;
                    f(&ctx, result).into_effect_result()
                }
                _ => Ok(()),
            }
        }));
        self
    }

    /// Runs after the error effect commits (also for aborts).
    pub fn error_side_effect<F, Ret>(mut self, f: F) -> Self
    where
        F: Fn(&SideEffectContext<'_, S, P, A>, &ActionError) -> Ret + Send + Sync + 'static,
        Ret: EffectReturn,
    {
        self.inner.error_side_effect = Some(side_effect_fn(move |env: &SideEffectEnv<'_, S, P>| {
            let ctx = env.typed::<A>()?;
            match env.payload {
                SidePayload::Error(error) => f(&ctx, error).into_effect_result(),
                _ => Ok(()),
            }
        }));
        self
    }

    /// How overlapping calls are resolved. Defaults to the engine's policy.
    pub fn policy(mut self, policy: ConflictPolicy) -> Self {
        self.inner.policy = Some(policy);
        self
    }

    /// Run calls with different ids in parallel.
    ///
    /// Sets the `Parallel` policy; calls with the same id queue.
    pub fn parallel<F, Id>(mut self, operation_id: F) -> Self
    where
        F: Fn(&A) -> Id + Send + Sync + 'static,
        Id: Into<String>,
    {
        let name = self.name.clone();
        let erased: ErasedOperationId = Arc::new(move |args: &ActionArgs| match args.downcast_ref::<A>() {
            Some(args) => operation_id(args).into(),
            None => {
                warn!(action = %name, "operation id requested for foreign arguments");
                DEFAULT_OPERATION_ID.to_string()
            }
        });
        self.inner.policy = Some(ConflictPolicy::Parallel);
        self.inner.operation_id = Some(erased);
        self
    }

    /// Allow `Store::abort_action` to cancel running invocations.
    pub fn abortable(mut self) -> Self {
        self.inner.abortable = true;
        self
    }

    /// Delay the whole invocation; only the last call within the window runs.
    pub fn debounce(mut self, delay: Duration) -> Self {
        self.inner.debounce.invocation = Some(delay);
        self
    }

    /// Delay side effects; the effect still commits immediately.
    pub fn debounce_side_effects(mut self, delay: Duration) -> Self {
        self.inner.debounce.side_effects = Some(delay);
        self
    }

    /// Errors are handled by the caller; never send them to the error notifier.
    pub fn error_managed(mut self) -> Self {
        self.inner.error_managed = true;
        self
    }
}

impl<S, P, A, R> From<AsyncBuilder<S, P, A, R>> for ActionDescriptor<S, P> {
    fn from(builder: AsyncBuilder<S, P, A, R>) -> Self {
        ActionDescriptor::Async(builder.inner)
    }
}
