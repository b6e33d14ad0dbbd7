//! The store handle, its builder, and the actions API.
//!
//! A [`Store`] is a cheap, cloneable handle. All mutable data lives in the
//! store's dispatch loop (see `dispatch.rs`); the handle only sends messages
//! and reads the last published [`Snapshot`].
//!
//! # Example
//!
//! ```ignore
//! #[derive(Clone, Default, Serialize)]
//! struct Counter { count: i64 }
//!
//! let store = Store::builder(Counter::default)
//!     .name("counter")
//!     .action("add", |a| a.sync(|state, by: &i64, _| state.count += *by))
//!     .build()?;
//!
//! let _sub = store.subscribe(|s| s.count, |count| println!("count = {}", count));
//! store.actions().call("add", 1i64).await?;
//! assert_eq!(store.get_state().count, 1);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::action::{ActionDescriptor, ActionFactory, ArgsSpec};
use crate::config::{EngineConfig, ErrorNotifier};
use crate::core::{extract_panic_message, ActionArgs, ActionValue, Props, State, StoreId};
use crate::derived::{DerivedDescriptor, DerivedEngine};
use crate::dispatch::{Call, Dispatcher, DispatcherParts, Message, PropsHook, Reply};
use crate::error::{ActionError, StoreError};
use crate::inflight::{ActivityGuard, ActivityTracker};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::snapshot::Snapshot;
use crate::subscription::{
    resolve_keys, state_fields, FieldsFn, KeyObserver, KeySelection, Observer, ObserverRegistry,
    ObserverRemoval, ProjectionObserver, Subscription,
};

/// Data shared by the store handle, the actions handle and the dispatch loop.
pub(crate) struct Shared {
    pub id: StoreId,
    pub name: Arc<str>,
    pub tracker: Arc<ActivityTracker>,
    pub unmounted: AtomicBool,
    pub shutdown: CancellationToken,
}

impl Shared {
    fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::Acquire)
    }

    fn unmount(&self) -> bool {
        let first = !self.unmounted.swap(true, Ordering::AcqRel);
        self.shutdown.cancel();
        first
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// How a call ended, when the store itself did not fail.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    /// The action ran. Async actions carry the operation result; sync
    /// actions carry the committed state as an `Arc<S>`.
    Completed(ActionValue),
    /// The operation failed. The error effect (if any) has been applied.
    Failed(ActionError),
    /// The invocation was aborted.
    Aborted,
    /// Discarded by the `Ignore` policy.
    Dropped,
    /// Replaced by a newer call (`KeepLast` or debounce).
    Superseded,
    /// Stopped by a middleware.
    Blocked {
        /// The reason the middleware gave.
        reason: String,
    },
}

impl ActionOutcome {
    /// The value of a completed call, if it has type `T`.
    pub fn value<T: Any>(&self) -> Option<&T> {
        match self {
            ActionOutcome::Completed(value) => value.downcast_ref(),
            _ => None,
        }
    }

    /// The committed state produced by a sync action.
    pub fn state<S: Any>(&self) -> Option<&Arc<S>> {
        self.value::<Arc<S>>()
    }

    /// The error of a failed call.
    pub fn error(&self) -> Option<&ActionError> {
        match self {
            ActionOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Returns true if the call completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, ActionOutcome::Completed(_))
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Handle for calling a store's actions.
///
/// Cloneable and usable from any task. Calls are checked (name, argument
/// type, store alive) and queued immediately; awaiting the returned
/// [`ActionCall`] only waits for the outcome.
pub struct Actions<S, P> {
    tx: mpsc::UnboundedSender<Message<P>>,
    specs: Arc<HashMap<Arc<str>, ArgsSpec>>,
    shared: Arc<Shared>,
    _state: PhantomData<fn() -> S>,
}

impl<S, P> Clone for Actions<S, P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            specs: self.specs.clone(),
            shared: self.shared.clone(),
            _state: PhantomData,
        }
    }
}

impl<S, P> Actions<S, P> {
    /// Call an action and get a future of its outcome.
    pub fn call<A: Send + Sync + 'static>(&self, action: &str, args: A) -> ActionCall {
        let (reply, rx) = oneshot::channel();
        match self.enqueue(action, args, Some(reply)) {
            Ok(()) => ActionCall {
                state: CallState::Pending(rx),
            },
            Err(e) => ActionCall {
                state: CallState::Ready(Some(Err(e))),
            },
        }
    }

    /// Call an action without waiting for its outcome.
    pub fn dispatch<A: Send + Sync + 'static>(&self, action: &str, args: A) -> Result<(), StoreError> {
        self.enqueue(action, args, None)
    }

    /// Returns true if an action with this name exists.
    pub fn contains(&self, action: &str) -> bool {
        self.specs.contains_key(action)
    }

    /// Names of all registered actions.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(|name| name.as_ref())
    }

    pub(crate) fn sender(&self) -> &mpsc::UnboundedSender<Message<P>> {
        &self.tx
    }

    fn enqueue<A: Send + Sync + 'static>(
        &self,
        action: &str,
        args: A,
        reply: Option<Reply>,
    ) -> Result<(), StoreError> {
        let (name, spec) = self
            .specs
            .get_key_value(action)
            .ok_or_else(|| StoreError::UnknownAction {
                action: action.to_string(),
            })?;
        let args = ActionArgs::new(args);
        if !spec.accepts(args.type_id()) {
            return Err(StoreError::ArgumentTypeMismatch {
                action: action.to_string(),
                expected: spec.type_name,
            });
        }
        if self.shared.is_unmounted() {
            return Err(StoreError::Disposed);
        }

        let call = Call {
            action: name.clone(),
            args,
            reply,
            _guard: self.shared.tracker.guard(),
        };
        self.tx
            .send(Message::Call(call))
            .map_err(|_| StoreError::Disposed)
    }
}

impl<S, P> fmt::Debug for Actions<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actions")
            .field("store", &self.shared.name)
            .field("actions", &self.specs.len())
            .finish_non_exhaustive()
    }
}

/// Future of one action call's outcome.
///
/// The call is already queued; dropping this future does not cancel it.
#[must_use = "the call runs either way; await it to see the outcome"]
pub struct ActionCall {
    state: CallState,
}

enum CallState {
    Ready(Option<Result<ActionOutcome, StoreError>>),
    Pending(oneshot::Receiver<Result<ActionOutcome, StoreError>>),
}

impl Future for ActionCall {
    type Output = Result<ActionOutcome, StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            CallState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(StoreError::Disposed))),
            // The loop dropped the reply without answering: it shut down.
            CallState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| Err(StoreError::Disposed))),
        }
    }
}

impl fmt::Debug for ActionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            CallState::Ready(_) => "ready",
            CallState::Pending(_) => "pending",
        };
        f.debug_struct("ActionCall").field("state", &state).finish()
    }
}

// =============================================================================
// Store
// =============================================================================

struct StoreInner<S, P> {
    shared: Arc<Shared>,
    registry: Arc<ObserverRegistry<S>>,
    actions: Actions<S, P>,
    idle_timeout: Duration,
}

impl<S, P> Drop for StoreInner<S, P> {
    fn drop(&mut self) {
        // Last handle gone: stop the loop so its task and timers end.
        self.shared.unmount();
    }
}

/// A reactive state container driven by named actions.
///
/// Clones share the same store.
pub struct Store<S, P = ()> {
    inner: Arc<StoreInner<S, P>>,
}

impl<S, P> Clone for Store<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: State> Store<S> {
    /// Start building a store without props.
    pub fn builder(initial: impl FnOnce() -> S + Send + 'static) -> StoreBuilder<S, ()> {
        StoreBuilder::new(Box::new(move |_: &()| initial()), ())
    }
}

impl<S: State, P: Props> Store<S, P> {
    /// Start building a store with props. The initial state may read them.
    pub fn builder_with_props(
        props: P,
        initial: impl FnOnce(&P) -> S + Send + 'static,
    ) -> StoreBuilder<S, P> {
        StoreBuilder::new(Box::new(initial), props)
    }

    /// The last committed state.
    pub fn get_state(&self) -> Arc<S> {
        self.inner.registry.current().state.clone()
    }

    /// The last committed snapshot (state, derived values, loading, errors).
    pub fn snapshot(&self) -> Snapshot<S> {
        self.inner.registry.current()
    }

    /// Handle for calling actions.
    pub fn actions(&self) -> &Actions<S, P> {
        &self.inner.actions
    }

    /// The current value of a derived state.
    pub fn derived<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.inner.registry.current().derived_value(name)
    }

    /// Call `listener` whenever the projection of the state changes.
    ///
    /// The projection is compared with `PartialEq` after every commit.
    pub fn subscribe<T, Sel, L>(&self, select: Sel, listener: L) -> Subscription
    where
        T: PartialEq + Clone + Send + 'static,
        Sel: Fn(&S) -> T + Send + Sync + 'static,
        L: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_snapshot(move |snapshot: &Snapshot<S>| select(&snapshot.state), listener)
    }

    /// Call `listener` whenever a projection of the whole snapshot changes.
    ///
    /// Unlike [`subscribe`](Self::subscribe) the selector also sees derived
    /// values and the loading and error maps:
    ///
    /// ```ignore
    /// let _sub = store.subscribe_snapshot(
    ///     |snap| (snap.is_loading("save", None), snap.error("save").is_some()),
    ///     |(saving, failed)| render(*saving, *failed),
    /// );
    /// ```
    pub fn subscribe_snapshot<T, Sel, L>(&self, select: Sel, listener: L) -> Subscription
    where
        T: PartialEq + Clone + Send + 'static,
        Sel: Fn(&Snapshot<S>) -> T + Send + Sync + 'static,
        L: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.registry.register(move |snapshot| {
            let observer: Box<dyn Observer<S>> = Box::new(ProjectionObserver::new(
                Box::new(select),
                Arc::new(listener),
                snapshot,
            ));
            observer
        });
        Subscription::new(id, self.weak_registry())
    }

    /// Call `listener` whenever one of the named keys changes.
    ///
    /// A key names a derived value, an action, or a top-level state field,
    /// checked in that order. `loading:<action>` selects whether the action
    /// is in flight and `error:<action>` its Error Map entry. Unknown keys
    /// are an error.
    pub fn subscribe_keys<K, I, L>(&self, keys: I, listener: L) -> Result<Subscription, StoreError>
    where
        S: Serialize,
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
        L: Fn(&KeySelection) + Send + Sync + 'static,
    {
        let to_json: FieldsFn<S> = state_fields::<S>;
        let actions = &self.inner.actions;
        let sources = resolve_keys(
            keys,
            &self.inner.registry.current(),
            |key| actions.contains(key),
            to_json,
        )?;

        let listener: Arc<dyn Fn(&KeySelection) + Send + Sync> = Arc::new(listener);
        let id = self.inner.registry.register(move |snapshot| {
            let observer: Box<dyn Observer<S>> =
                Box::new(KeyObserver::new(sources, to_json, listener, snapshot));
            observer
        });
        Ok(Subscription::new(id, self.weak_registry()))
    }

    fn weak_registry(&self) -> Weak<dyn ObserverRemoval> {
        let registry: Arc<dyn ObserverRemoval> = self.inner.registry.clone();
        Arc::downgrade(&registry)
    }

    /// A receiver that sees every committed snapshot.
    pub fn watch(&self) -> watch::Receiver<Snapshot<S>> {
        self.inner.registry.watch()
    }

    /// Abort running invocations of an abortable async action.
    ///
    /// With `operation_id = None` every running invocation of the action is
    /// aborted. Aborting a non-abortable action, or one that is not running,
    /// does nothing.
    pub fn abort_action(&self, action: &str, operation_id: Option<&str>) {
        let message = Message::Abort {
            action: action.to_string(),
            operation_id: operation_id.map(str::to_string),
            guard: self.inner.shared.tracker.guard(),
        };
        // A disposed store has nothing left to abort.
        let _ = self.inner.actions.sender().send(message);
    }

    /// Returns true while the action (or one operation id of it) is in flight.
    pub fn is_loading(&self, action: &str, operation_id: Option<&str>) -> bool {
        self.inner.registry.current().is_loading(action, operation_id)
    }

    /// The last recorded error of an action.
    pub fn get_error(&self, action: &str) -> Option<ActionError> {
        self.inner.registry.current().error(action).cloned()
    }

    /// Remove the recorded error of an action.
    pub async fn clear_error(&self, action: &str) -> Result<(), StoreError> {
        let action = action.to_string();
        self.request(move |done, guard| Message::ClearError {
            action,
            done,
            guard,
        })
        .await
    }

    /// Replace the props. Derived values are refreshed and `on_props_change`
    /// runs before this returns.
    pub async fn set_props(&self, props: P) -> Result<(), StoreError> {
        self.request(move |done, guard| Message::SetProps { props, done, guard })
            .await
    }

    async fn request<F>(&self, build: F) -> Result<(), StoreError>
    where
        F: FnOnce(oneshot::Sender<()>, ActivityGuard) -> Message<P>,
    {
        if self.is_disposed() {
            return Err(StoreError::Disposed);
        }
        let (done, rx) = oneshot::channel();
        let message = build(done, self.inner.shared.tracker.guard());
        self.inner
            .actions
            .sender()
            .send(message)
            .map_err(|_| StoreError::Disposed)?;
        rx.await.map_err(|_| StoreError::Disposed)
    }

    /// Tear the store down.
    ///
    /// Running operations are cancelled, debounce timers cleared and every
    /// pending caller gets `StoreError::Disposed`. Idempotent.
    pub fn dispose(&self) {
        if self.inner.shared.unmount() {
            info!(
                store = %self.inner.shared.name,
                store_id = %self.inner.shared.id,
                observers = self.inner.registry.len(),
                "store disposed"
            );
        }
    }

    /// Returns true once `dispose` was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.shared.is_unmounted()
    }

    /// Wait until no calls, operations or debounce timers are pending,
    /// up to the configured idle timeout.
    pub async fn wait_idle(&self) -> Result<(), StoreError> {
        self.wait_idle_timeout(self.inner.idle_timeout).await
    }

    /// Wait until the store is idle, up to `timeout`.
    pub async fn wait_idle_timeout(&self, timeout: Duration) -> Result<(), StoreError> {
        self.inner.shared.tracker.wait_idle(timeout).await
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// The store's unique id.
    pub fn id(&self) -> StoreId {
        self.inner.shared.id
    }
}

impl<S, P> fmt::Debug for Store<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.shared.name)
            .field("id", &self.inner.shared.id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

type InitialState<S, P> = Box<dyn FnOnce(&P) -> S + Send>;
type MountHook<S, P> = Box<dyn FnOnce(&Actions<S, P>, &P) + Send>;

/// Builder for [`Store`].
pub struct StoreBuilder<S, P> {
    initial: InitialState<S, P>,
    props: P,
    actions: Vec<(String, ActionDescriptor<S, P>)>,
    derived: Vec<DerivedDescriptor<S, P>>,
    middlewares: Vec<Arc<dyn Middleware<S>>>,
    on_mount: Option<MountHook<S, P>>,
    on_props_change: Option<PropsHook<S, P>>,
    notifier: Option<Arc<dyn ErrorNotifier>>,
    name: Option<String>,
    config: EngineConfig,
}

impl<S: State, P: Props> StoreBuilder<S, P> {
    fn new(initial: InitialState<S, P>, props: P) -> Self {
        Self {
            initial,
            props,
            actions: Vec::new(),
            derived: Vec::new(),
            middlewares: Vec::new(),
            on_mount: None,
            on_props_change: None,
            notifier: None,
            name: None,
            config: EngineConfig::default(),
        }
    }

    /// Register an action, built with an [`ActionFactory`].
    pub fn action<D, F>(mut self, name: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(ActionFactory<S, P>) -> D,
        D: Into<ActionDescriptor<S, P>>,
    {
        let name = name.into();
        let descriptor = build(ActionFactory::new(&name)).into();
        self.actions.push((name, descriptor));
        self
    }

    /// Register an already-built descriptor.
    pub fn descriptor(mut self, name: impl Into<String>, descriptor: ActionDescriptor<S, P>) -> Self {
        self.actions.push((name.into(), descriptor));
        self
    }

    /// Register a derived value.
    pub fn derived(mut self, descriptor: DerivedDescriptor<S, P>) -> Self {
        self.derived.push(descriptor);
        self
    }

    /// Add a middleware. Middlewares run in the order they are added.
    pub fn middleware(mut self, middleware: impl Middleware<S>) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Run once after the dispatch loop starts, with the actions and props.
    pub fn on_mount(mut self, hook: impl FnOnce(&Actions<S, P>, &P) + Send + 'static) -> Self {
        self.on_mount = Some(Box::new(hook));
        self
    }

    /// Run after every `set_props` with the previous and new props.
    pub fn on_props_change(
        mut self,
        hook: impl Fn(&P, &P, &Actions<S, P>) + Send + Sync + 'static,
    ) -> Self {
        self.on_props_change = Some(Box::new(hook));
        self
    }

    /// Send this store's unhandled errors here instead of the configured notifier.
    pub fn notify_error(mut self, notifier: impl ErrorNotifier) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Name used in logs and passed to the error notifier.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Use engine settings other than the defaults.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and start the store.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Store<S, P>, StoreError> {
        let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;

        let mut descriptors: HashMap<Arc<str>, Arc<ActionDescriptor<S, P>>> = HashMap::new();
        let mut specs: HashMap<Arc<str>, ArgsSpec> = HashMap::new();
        for (name, descriptor) in self.actions {
            if name.is_empty() {
                return Err(StoreError::EmptyName);
            }
            descriptor.validate(&name, self.config.default_policy)?;
            let name: Arc<str> = Arc::from(name);
            if descriptors.contains_key(&name) {
                return Err(StoreError::DuplicateAction {
                    action: name.to_string(),
                });
            }
            specs.insert(name.clone(), *descriptor.args());
            descriptors.insert(name, Arc::new(descriptor));
        }

        let mut derived_names = Vec::with_capacity(self.derived.len());
        for descriptor in &self.derived {
            let name = descriptor.name();
            if name.is_empty() {
                return Err(StoreError::EmptyName);
            }
            if derived_names.contains(&name) {
                return Err(StoreError::DuplicateDerived {
                    name: name.to_string(),
                });
            }
            if specs.contains_key(name) {
                return Err(StoreError::NameCollision {
                    name: name.to_string(),
                });
            }
            derived_names.push(name);
        }
        let derived_count = derived_names.len();

        let name: Arc<str> = Arc::from(self.name.unwrap_or_else(|| "store".to_string()));
        let shared = Arc::new(Shared {
            id: StoreId::new(),
            name,
            tracker: Arc::new(ActivityTracker::new()),
            unmounted: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let state = Arc::new((self.initial)(&self.props));
        let props = Arc::new(self.props);
        let derived = DerivedEngine::new(self.derived, &*state, &*props);
        let registry = Arc::new(ObserverRegistry::new(Snapshot::new(
            state.clone(),
            derived.values(),
            Default::default(),
            Default::default(),
            0,
        )));

        let (tx, rx) = mpsc::unbounded_channel();
        let actions = Actions {
            tx,
            specs: Arc::new(specs),
            shared: shared.clone(),
            _state: PhantomData,
        };

        let action_count = descriptors.len();
        let dispatcher = Dispatcher::new(DispatcherParts {
            shared: shared.clone(),
            registry: registry.clone(),
            descriptors,
            middleware: MiddlewareChain::new(self.middlewares),
            notifier: self.notifier.unwrap_or(self.config.error_notifier),
            default_policy: self.config.default_policy,
            on_props_change: self.on_props_change,
            actions: actions.clone(),
            rx,
            state,
            props: props.clone(),
            derived,
        });
        runtime.spawn(dispatcher.run());

        info!(
            store = %shared.name,
            store_id = %shared.id,
            actions = action_count,
            derived = derived_count,
            "store built"
        );

        if let Some(hook) = self.on_mount {
            if let Err(panic_info) = catch_unwind(AssertUnwindSafe(|| hook(&actions, &*props))) {
                error!(
                    store = %shared.name,
                    panic = %extract_panic_message(&panic_info),
                    "mount hook panicked"
                );
            }
        }

        Ok(Store {
            inner: Arc::new(StoreInner {
                shared,
                registry,
                actions,
                idle_timeout: self.config.idle_timeout,
            }),
        })
    }
}

impl<S, P> fmt::Debug for StoreBuilder<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("name", &self.name)
            .field("actions", &self.actions.len())
            .field("derived", &self.derived.len())
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}
