//! The dispatch loop: one task per store that owns every piece of mutable
//! store data and applies every transition.
//!
//! Callers never touch state directly. They send [`Message`]s into an
//! unbounded mailbox; the loop handles them one at a time:
//!
//! ```text
//! Actions::call ──► Message::Call ──► middleware ──► debounce? ──► resolver
//!                                                                    │
//!                      ┌── pre_effect commit ◄── RunNow ─────────────┘
//!                      ├── optimistic commit
//!                      └── spawn operation ──► Message::Settled ──► effect commit
//!                                                                    └─► side effect
//! ```
//!
//! Operations run on their own tasks and only ever talk back through the
//! mailbox, so effects never run concurrently and every published snapshot
//! is the result of exactly one transition.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::action::{ActionDescriptor, AsyncAction, ErasedEffect, OperationContext};
use crate::config::ErrorNotifier;
use crate::conflict::{Admission, ConflictPolicy, ConflictResolver, SlotKey};
use crate::core::{
    extract_panic_message, ActionArgs, ActionValue, InvocationId, Props, State, DEFAULT_OPERATION_ID,
};
use crate::derived::DerivedEngine;
use crate::effect::{apply_effect, ErasedSideEffect, PendingSideEffect, SidePayload};
use crate::error::{ActionError, EffectPhase, StoreError};
use crate::inflight::ActivityGuard;
use crate::journal::Journal;
use crate::middleware::{
    AbortEvent, DispatchEvent, EffectEvent, ErrorEvent, Flow, MiddlewareChain, RollbackEvent,
};
use crate::scheduler::{DebounceKey, DebounceKind, DebounceScheduler};
use crate::snapshot::{ErrorMap, ErrorRecord, LoadingMap, Snapshot};
use crate::store::{ActionOutcome, Actions, Shared};
use crate::subscription::ObserverRegistry;

pub(crate) type Reply = oneshot::Sender<Result<ActionOutcome, StoreError>>;

/// Called with `(previous, next, actions)` after props are replaced.
pub(crate) type PropsHook<S, P> = Box<dyn Fn(&P, &P, &Actions<S, P>) + Send + Sync>;

// =============================================================================
// Messages
// =============================================================================

/// One call of an action, from mailbox to settlement.
pub(crate) struct Call {
    pub action: Arc<str>,
    pub args: ActionArgs,
    pub reply: Option<Reply>,
    /// Keeps the store busy until the call settles.
    pub _guard: ActivityGuard,
}

impl Call {
    fn respond(self, result: Result<ActionOutcome, StoreError>) {
        if let Some(reply) = self.reply {
            // The caller may have stopped waiting; that's fine.
            let _ = reply.send(result);
        }
    }
}

/// Everything the dispatch loop reacts to.
pub(crate) enum Message<P> {
    Call(Call),
    Settled {
        invocation: InvocationId,
        outcome: Result<ActionValue>,
        guard: ActivityGuard,
    },
    Abort {
        action: String,
        operation_id: Option<String>,
        guard: ActivityGuard,
    },
    DebounceElapsed {
        key: DebounceKey,
        generation: u64,
        guard: ActivityGuard,
    },
    ClearError {
        action: String,
        done: oneshot::Sender<()>,
        guard: ActivityGuard,
    },
    SetProps {
        props: P,
        done: oneshot::Sender<()>,
        guard: ActivityGuard,
    },
}

/// An async call whose operation is running.
struct Invocation {
    call: Call,
    key: SlotKey,
    token: CancellationToken,
    /// Journal handle of the optimistic effect, kept only when rollback is tracked.
    optimistic: Option<u64>,
}

/// Work parked behind a debounce timer.
enum DebouncedWork<S, P> {
    Invocation(Call),
    SideEffect {
        pending: PendingSideEffect<S, P>,
        _guard: ActivityGuard,
    },
}

impl<S, P> DebouncedWork<S, P> {
    /// A newer call took this one's place in the bucket.
    fn supersede(self) {
        if let DebouncedWork::Invocation(call) = self {
            call.respond(Ok(ActionOutcome::Superseded));
        }
    }

    /// The store went away before the timer fired.
    fn cancel(self) {
        if let DebouncedWork::Invocation(call) = self {
            call.respond(Err(StoreError::Disposed));
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Parts of a store handed to the dispatch loop at build time.
pub(crate) struct DispatcherParts<S, P> {
    pub shared: Arc<Shared>,
    pub registry: Arc<ObserverRegistry<S>>,
    pub descriptors: HashMap<Arc<str>, Arc<ActionDescriptor<S, P>>>,
    pub middleware: MiddlewareChain<S>,
    pub notifier: Arc<dyn ErrorNotifier>,
    pub default_policy: ConflictPolicy,
    pub on_props_change: Option<PropsHook<S, P>>,
    pub actions: Actions<S, P>,
    pub rx: mpsc::UnboundedReceiver<Message<P>>,
    pub state: Arc<S>,
    pub props: Arc<P>,
    pub derived: DerivedEngine<S, P>,
}

/// The serialized dispatch loop of one store.
pub(crate) struct Dispatcher<S, P> {
    shared: Arc<Shared>,
    registry: Arc<ObserverRegistry<S>>,
    descriptors: HashMap<Arc<str>, Arc<ActionDescriptor<S, P>>>,
    middleware: MiddlewareChain<S>,
    notifier: Arc<dyn ErrorNotifier>,
    default_policy: ConflictPolicy,
    on_props_change: Option<PropsHook<S, P>>,
    actions: Actions<S, P>,
    rx: mpsc::UnboundedReceiver<Message<P>>,

    // Committed data. Published together as one snapshot.
    state: Arc<S>,
    props: Arc<P>,
    derived: DerivedEngine<S, P>,
    loading: Arc<LoadingMap>,
    errors: Arc<ErrorMap>,
    version: u64,

    resolver: ConflictResolver<Call>,
    running: HashMap<InvocationId, Invocation>,
    debounce: DebounceScheduler<DebouncedWork<S, P>>,
    journal: Journal<S>,
}

impl<S: State, P: Props> Dispatcher<S, P> {
    pub fn new(parts: DispatcherParts<S, P>) -> Self {
        Self {
            shared: parts.shared,
            registry: parts.registry,
            descriptors: parts.descriptors,
            middleware: parts.middleware,
            notifier: parts.notifier,
            default_policy: parts.default_policy,
            on_props_change: parts.on_props_change,
            actions: parts.actions,
            rx: parts.rx,
            state: parts.state,
            props: parts.props,
            derived: parts.derived,
            loading: Arc::new(LoadingMap::default()),
            errors: Arc::new(ErrorMap::default()),
            version: 0,
            resolver: ConflictResolver::new(),
            running: HashMap::new(),
            debounce: DebounceScheduler::new(),
            journal: Journal::new(),
        }
    }

    /// Run until the store is disposed or dropped.
    pub async fn run(mut self) {
        info!(
            store = %self.shared.name,
            store_id = %self.shared.id,
            actions = self.descriptors.len(),
            "store dispatch loop starting"
        );

        let shutdown = self.shared.shutdown.clone();
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle(message);
        }

        self.shutdown();
        info!(store = %self.shared.name, store_id = %self.shared.id, "store dispatch loop stopped");
    }

    fn handle(&mut self, message: Message<P>) {
        match message {
            Message::Call(call) => self.on_call(call),
            Message::Settled {
                invocation,
                outcome,
                guard: _guard,
            } => self.on_settled(invocation, outcome),
            Message::Abort {
                action,
                operation_id,
                guard: _guard,
            } => self.on_abort(&action, operation_id.as_deref()),
            Message::DebounceElapsed {
                key,
                generation,
                guard: _guard,
            } => self.on_debounce_elapsed(key, generation),
            Message::ClearError {
                action,
                done,
                guard: _guard,
            } => {
                if self.clear_error_entry(&action) {
                    self.commit(None);
                }
                let _ = done.send(());
            }
            Message::SetProps {
                props,
                done,
                guard: _guard,
            } => {
                self.on_set_props(props);
                let _ = done.send(());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    fn on_call(&mut self, call: Call) {
        let Some(descriptor) = self.descriptors.get(&call.action).cloned() else {
            let action = call.action.to_string();
            call.respond(Err(StoreError::UnknownAction { action }));
            return;
        };

        let flow = self.middleware.dispatch(&DispatchEvent {
            action: &call.action,
            args: &call.args,
            state: &self.state,
        });
        if let Flow::Halt { reason } = flow {
            debug!(store = %self.shared.name, action = %call.action, %reason, "call halted by middleware");
            call.respond(Ok(ActionOutcome::Blocked { reason }));
            return;
        }

        match descriptor.debounce().invocation {
            Some(delay) => self.debounce_call(call, delay),
            None => self.execute(&descriptor, call),
        }
    }

    fn debounce_call(&mut self, call: Call, delay: Duration) {
        let key = DebounceKey::new(call.action.clone(), DebounceKind::Invocation);
        let elapsed = self.timer_callback();
        if let Some(replaced) = self
            .debounce
            .schedule(key, delay, DebouncedWork::Invocation(call), elapsed)
        {
            replaced.supersede();
        }
    }

    /// Callback handed to debounce timers: report back through the mailbox.
    fn timer_callback(&self) -> impl FnOnce(DebounceKey, u64) + Send + 'static {
        let tx = self.actions.sender().clone();
        let tracker = self.shared.tracker.clone();
        move |key, generation| {
            let _ = tx.send(Message::DebounceElapsed {
                key,
                generation,
                guard: tracker.guard(),
            });
        }
    }

    fn on_debounce_elapsed(&mut self, key: DebounceKey, generation: u64) {
        let Some(work) = self.debounce.fire(&key, generation) else {
            trace!(action = %key.action, kind = %key.kind, generation, "stale debounce timer");
            return;
        };
        match work {
            DebouncedWork::Invocation(call) => match self.descriptors.get(&call.action).cloned() {
                Some(descriptor) => self.execute(&descriptor, call),
                None => {
                    let action = call.action.to_string();
                    call.respond(Err(StoreError::UnknownAction { action }));
                }
            },
            DebouncedWork::SideEffect { pending, _guard } => {
                pending.run(&self.state, &self.props, &self.actions);
            }
        }
    }

    fn execute(&mut self, descriptor: &ActionDescriptor<S, P>, call: Call) {
        match descriptor {
            ActionDescriptor::Sync(action) => self.run_sync(call, &action.transform, None, None),
            ActionDescriptor::AdvancedSync(action) => self.run_sync(
                call,
                &action.effect,
                action.side_effect.as_ref(),
                action.debounce.side_effects,
            ),
            ActionDescriptor::Async(action) => self.admit(action, call),
        }
    }

    fn run_sync(
        &mut self,
        call: Call,
        effect: &ErasedEffect<S, P>,
        side_effect: Option<&ErasedSideEffect<S, P>>,
        side_effect_delay: Option<Duration>,
    ) {
        let before = self.state.clone();
        let props = self.props.clone();
        let applied = apply_effect(&call.action, EffectPhase::Sync, &*before, |draft| {
            effect(draft, &call.args, &*props)
        });

        match applied {
            Ok(next) => {
                let after = Arc::new(next);
                self.journal.record(&call.action, EffectPhase::Sync, &before, || {
                    let (effect, args, props) = (effect.clone(), call.args.clone(), props.clone());
                    Arc::new(move |draft: &mut S| effect(draft, &args, &*props))
                });
                self.commit(Some(after.clone()));
                self.middleware.effect(&EffectEvent {
                    action: &call.action,
                    args: &call.args,
                    phase: EffectPhase::Sync,
                    before: &before,
                    after: &after,
                });
                if let Some(run) = side_effect {
                    self.schedule_side_effect(
                        PendingSideEffect {
                            action: call.action.clone(),
                            args: call.args.clone(),
                            payload: SidePayload::None,
                            run: run.clone(),
                        },
                        side_effect_delay,
                    );
                }
                call.respond(Ok(ActionOutcome::Completed(ActionValue::new(after))));
            }
            Err(e) => call.respond(Err(e)),
        }
    }

    fn admit(&mut self, action: &AsyncAction<S, P>, call: Call) {
        let policy = action.effective_policy(self.default_policy);
        let operation_id: Arc<str> = match &action.operation_id {
            Some(id_fn) => match catch_unwind(AssertUnwindSafe(|| id_fn(&call.args))) {
                Ok(id) => Arc::from(id),
                Err(panic_info) => {
                    let message = extract_panic_message(&panic_info);
                    error!(store = %self.shared.name, action = %call.action, panic = %message, "operation id function panicked");
                    let action = call.action.to_string();
                    call.respond(Err(StoreError::OperationId { action, message }));
                    return;
                }
            },
            None => Arc::from(DEFAULT_OPERATION_ID),
        };

        let key = SlotKey::new(call.action.clone(), operation_id);
        match self.resolver.admit(key.clone(), policy, call) {
            Admission::RunNow(call) => self.start(action, call, key),
            Admission::Queued => {
                debug!(store = %self.shared.name, slot = %key, %policy, "call queued");
            }
            Admission::Superseded(displaced) => {
                debug!(store = %self.shared.name, slot = %key, superseded = displaced.len(), "queued calls replaced");
                for call in displaced {
                    call.respond(Ok(ActionOutcome::Superseded));
                }
            }
            Admission::Dropped(call) => {
                debug!(store = %self.shared.name, slot = %key, "call dropped, slot busy");
                call.respond(Ok(ActionOutcome::Dropped));
            }
            Admission::Rejected(call) => {
                debug!(store = %self.shared.name, slot = %key, "call rejected, slot busy");
                call.respond(Err(StoreError::Conflict {
                    action: key.action.to_string(),
                    operation_id: key.operation_id.to_string(),
                }));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Invocation lifecycle
    // -------------------------------------------------------------------------

    /// Run the pre-effect and optimistic effect, then spawn the operation.
    fn start(&mut self, action: &AsyncAction<S, P>, call: Call, key: SlotKey) {
        Arc::make_mut(&mut self.loading).start(&key.action, &key.operation_id);

        let props = self.props.clone();
        let before = self.state.clone();
        let interim = match &action.pre_effect {
            Some(pre) => match apply_effect(&call.action, EffectPhase::PreEffect, &*before, |draft| {
                pre(draft, &call.args, &*props)
            }) {
                Ok(next) => Some(Arc::new(next)),
                Err(e) => return self.abandon(call, key, e),
            },
            None => None,
        };
        if let (Some(_), Some(pre)) = (&interim, &action.pre_effect) {
            self.journal.record(&call.action, EffectPhase::PreEffect, &before, || {
                let (pre, args, props) = (pre.clone(), call.args.clone(), props.clone());
                Arc::new(move |draft: &mut S| pre(draft, &args, &*props))
            });
        }
        // Publishes the loading flag even without a pre-effect.
        self.commit(interim.clone());
        if let Some(after) = &interim {
            self.middleware.effect(&EffectEvent {
                action: &call.action,
                args: &call.args,
                phase: EffectPhase::PreEffect,
                before: &before,
                after,
            });
        }

        let mut journaled = None;
        if let Some(optimistic) = &action.optimistic {
            let before = self.state.clone();
            match apply_effect(&call.action, EffectPhase::Optimistic, &*before, |draft| {
                optimistic(draft, &call.args, &*props)
            }) {
                Ok(next) => {
                    let after = Arc::new(next);
                    if self.middleware.tracks_optimistic() {
                        let (optimistic, args, props) =
                            (optimistic.clone(), call.args.clone(), props.clone());
                        journaled = Some(self.journal.open(
                            &call.action,
                            &before,
                            Arc::new(move |draft: &mut S| optimistic(draft, &args, &*props)),
                        ));
                    }
                    self.commit(Some(after.clone()));
                    self.middleware.effect(&EffectEvent {
                        action: &call.action,
                        args: &call.args,
                        phase: EffectPhase::Optimistic,
                        before: &before,
                        after: &after,
                    });
                }
                Err(e) => return self.abandon(call, key, e),
            }
        }

        let invocation = InvocationId::next();
        let token = self.shared.shutdown.child_token();
        let ctx = OperationContext::new(
            self.state.clone(),
            self.props.clone(),
            token.clone(),
            call.action.clone(),
            key.operation_id.clone(),
        );
        self.spawn_operation(invocation, action, &call, ctx, token.clone());

        debug!(
            store = %self.shared.name,
            slot = %key,
            %invocation,
            "operation started"
        );
        self.running.insert(
            invocation,
            Invocation {
                call,
                key,
                token,
                optimistic: journaled,
            },
        );
    }

    fn spawn_operation(
        &self,
        invocation: InvocationId,
        action: &AsyncAction<S, P>,
        call: &Call,
        ctx: OperationContext<S, P>,
        token: CancellationToken,
    ) {
        let operation = action.operation.clone();
        let args = call.args.clone();
        let name = call.action.clone();
        let tx = self.actions.sender().clone();
        let guard = self.shared.tracker.guard();

        tokio::spawn(async move {
            let run = AssertUnwindSafe(async move { operation(&args, ctx).await }).catch_unwind();
            let outcome = tokio::select! {
                // Aborted or disposed: the loop already settled this invocation.
                _ = token.cancelled() => return,
                result = run => match result {
                    Ok(outcome) => outcome,
                    Err(panic_info) => {
                        let message = extract_panic_message(&panic_info);
                        error!(action = %name, %invocation, panic = %message, "operation panicked");
                        Err(anyhow::anyhow!("operation panicked: {}", message))
                    }
                },
            };
            let _ = tx.send(Message::Settled {
                invocation,
                outcome,
                guard,
            });
        });
    }

    /// A call that failed before its operation started.
    fn abandon(&mut self, call: Call, key: SlotKey, error: StoreError) {
        let next = self.release_slot(&key);
        self.commit(None);
        call.respond(Err(error));
        self.start_next(key, next);
    }

    fn on_settled(&mut self, invocation: InvocationId, outcome: Result<ActionValue>) {
        let Some(running) = self.running.remove(&invocation) else {
            warn!(store = %self.shared.name, %invocation, "discarding late completion");
            return;
        };
        let descriptor = self.descriptors.get(&running.key.action).cloned();
        let Some(ActionDescriptor::Async(action)) = descriptor.as_deref() else {
            return;
        };

        match outcome {
            Ok(value) => self.succeed(action, running, value),
            Err(e) => {
                let error = ActionError::failed(&running.call.action, e);
                self.fail(action, running, error);
            }
        }
    }

    fn succeed(&mut self, action: &AsyncAction<S, P>, invocation: Invocation, value: ActionValue) {
        let Invocation { call, key, .. } = invocation;
        let before = self.state.clone();
        let props = self.props.clone();
        let applied = match &action.on_success {
            Some(effect) => apply_effect(&call.action, EffectPhase::Success, &*before, |draft| {
                effect(draft, &call.args, &value, &*props)
            })
            .map(|next| Some(Arc::new(next))),
            None => Ok(None),
        };

        let next = self.release_slot(&key);
        match applied {
            Ok(after) => {
                if let (Some(_), Some(effect)) = (&after, &action.on_success) {
                    self.journal.record(&call.action, EffectPhase::Success, &before, || {
                        let (effect, args, value, props) =
                            (effect.clone(), call.args.clone(), value.clone(), props.clone());
                        Arc::new(move |draft: &mut S| effect(draft, &args, &value, &*props))
                    });
                }
                self.clear_error_entry(&call.action);
                self.commit(after.clone());
                if let Some(after) = &after {
                    self.middleware.effect(&EffectEvent {
                        action: &call.action,
                        args: &call.args,
                        phase: EffectPhase::Success,
                        before: &before,
                        after,
                    });
                }
                if let Some(run) = &action.side_effect {
                    self.schedule_side_effect(
                        PendingSideEffect {
                            action: call.action.clone(),
                            args: call.args.clone(),
                            payload: SidePayload::Value(value.clone()),
                            run: run.clone(),
                        },
                        action.debounce.side_effects,
                    );
                }
                debug!(store = %self.shared.name, slot = %key, "operation succeeded");
                call.respond(Ok(ActionOutcome::Completed(value)));
            }
            Err(e) => {
                self.commit(None);
                call.respond(Err(e));
            }
        }
        self.trim_journal();
        self.start_next(key, next);
    }

    /// Settle an invocation that failed or was aborted.
    fn fail(&mut self, action: &AsyncAction<S, P>, invocation: Invocation, error: ActionError) {
        let Invocation {
            call,
            key,
            optimistic,
            ..
        } = invocation;
        let before = self.state.clone();

        let base = match optimistic {
            Some(seq) => match self.journal.revert(seq) {
                Some(restored) => {
                    debug!(store = %self.shared.name, slot = %key, "rolling back optimistic update");
                    self.middleware.rollback(&RollbackEvent {
                        action: &call.action,
                        args: &call.args,
                        operation_id: &key.operation_id,
                        before: &before,
                        restored: &restored,
                    });
                    restored
                }
                None => {
                    warn!(
                        store = %self.shared.name,
                        slot = %key,
                        "optimistic update no longer journaled, nothing rolled back"
                    );
                    before.clone()
                }
            },
            None => before.clone(),
        };

        let props = self.props.clone();
        let (next_state, error_effect, effect_error) = match &action.on_error {
            Some(effect) => match apply_effect(&call.action, EffectPhase::Error, &*base, |draft| {
                effect(draft, &call.args, &error, &*props)
            }) {
                Ok(next) => (Arc::new(next), Some(effect), None),
                Err(e) => (base.clone(), None, Some(e)),
            },
            None => (base.clone(), None, None),
        };
        if let Some(effect) = error_effect {
            self.journal.record(&call.action, EffectPhase::Error, &base, || {
                let (effect, args, error, props) =
                    (effect.clone(), call.args.clone(), error.clone(), props.clone());
                Arc::new(move |draft: &mut S| effect(draft, &args, &error, &*props))
            });
        }

        if !error.is_abort() {
            Arc::make_mut(&mut self.errors).record(
                &call.action,
                ErrorRecord {
                    error: error.clone(),
                    operation_id: key.operation_id.clone(),
                    occurred_at: Utc::now(),
                },
            );
        }

        let next = self.release_slot(&key);
        if Arc::ptr_eq(&before, &next_state) {
            self.commit(None);
        } else {
            self.commit(Some(next_state.clone()));
        }
        if error_effect.is_some() {
            self.middleware.effect(&EffectEvent {
                action: &call.action,
                args: &call.args,
                phase: EffectPhase::Error,
                before: &base,
                after: &next_state,
            });
        }

        if error.is_abort() {
            self.middleware.abort(&AbortEvent {
                action: &call.action,
                args: &call.args,
                operation_id: &key.operation_id,
                before: &before,
                after: &next_state,
            });
        } else {
            self.middleware.error(&ErrorEvent {
                action: &call.action,
                args: &call.args,
                operation_id: &key.operation_id,
                error: &error,
                before: &before,
                after: &next_state,
            });
            if !action.error_managed && action.on_error.is_none() {
                self.notify(&error);
            }
        }

        if let Some(run) = &action.error_side_effect {
            self.schedule_side_effect(
                PendingSideEffect {
                    action: call.action.clone(),
                    args: call.args.clone(),
                    payload: SidePayload::Error(error.clone()),
                    run: run.clone(),
                },
                action.debounce.side_effects,
            );
        }

        debug!(store = %self.shared.name, slot = %key, error = %error, "operation settled with error");
        let result = match effect_error {
            Some(e) => Err(e),
            None if error.is_abort() => Ok(ActionOutcome::Aborted),
            None => Ok(ActionOutcome::Failed(error)),
        };
        call.respond(result);
        self.trim_journal();
        self.start_next(key, next);
    }

    fn on_abort(&mut self, action: &str, operation_id: Option<&str>) {
        let descriptor = self.descriptors.get(action).cloned();
        let Some(ActionDescriptor::Async(spec)) = descriptor.as_deref() else {
            debug!(store = %self.shared.name, action, "abort ignored, not an async action");
            return;
        };
        if !spec.abortable {
            debug!(store = %self.shared.name, action, "abort ignored, action is not abortable");
            return;
        }

        let mut targets: Vec<InvocationId> = self
            .running
            .iter()
            .filter(|(_, inv)| {
                &*inv.key.action == action && operation_id.map_or(true, |id| &*inv.key.operation_id == id)
            })
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            debug!(store = %self.shared.name, action, ?operation_id, "abort ignored, nothing running");
            return;
        }
        targets.sort();

        for id in targets {
            if let Some(invocation) = self.running.remove(&id) {
                invocation.token.cancel();
                debug!(store = %self.shared.name, slot = %invocation.key, invocation = %id, "operation aborted");
                self.fail(spec, invocation, ActionError::aborted(action));
            }
        }
    }

    /// Free a slot. The next waiting call, if any, inherits it along with
    /// its loading flag.
    fn release_slot(&mut self, key: &SlotKey) -> Option<Call> {
        let next = self.resolver.release(key);
        if next.is_none() {
            Arc::make_mut(&mut self.loading).finish(&key.action, &key.operation_id);
        }
        next
    }

    /// Forget journaled transitions no outstanding optimistic update can
    /// roll back past.
    fn trim_journal(&mut self) {
        if !self.journal.is_active() {
            return;
        }
        let oldest = self.running.values().filter_map(|inv| inv.optimistic).min();
        self.journal.trim(oldest);
        trace!(store = %self.shared.name, journaled = self.journal.len(), "journal trimmed");
    }

    fn start_next(&mut self, key: SlotKey, next: Option<Call>) {
        let Some(call) = next else {
            return;
        };
        let descriptor = self.descriptors.get(&key.action).cloned();
        match descriptor.as_deref() {
            Some(ActionDescriptor::Async(action)) => self.start(action, call, key),
            _ => {
                let action = call.action.to_string();
                call.respond(Err(StoreError::UnknownAction { action }));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commit & side effects
    // -------------------------------------------------------------------------

    /// Publish a new snapshot, optionally with a new state.
    fn commit(&mut self, state: Option<Arc<S>>) {
        if let Some(state) = state {
            self.state = state;
        }
        let derived = self.derived.refresh(&self.state, &self.props);
        self.version += 1;
        trace!(store = %self.shared.name, version = self.version, "commit");
        self.registry.publish(Snapshot::new(
            self.state.clone(),
            derived,
            self.loading.clone(),
            self.errors.clone(),
            self.version,
        ));
    }

    fn schedule_side_effect(&mut self, pending: PendingSideEffect<S, P>, delay: Option<Duration>) {
        match delay {
            None => pending.run(&self.state, &self.props, &self.actions),
            Some(delay) => {
                let key = DebounceKey::new(pending.action.clone(), DebounceKind::SideEffect);
                let work = DebouncedWork::SideEffect {
                    pending,
                    _guard: self.shared.tracker.guard(),
                };
                let elapsed = self.timer_callback();
                if self.debounce.schedule(key, delay, work, elapsed).is_some() {
                    trace!(store = %self.shared.name, "pending side effect replaced");
                }
            }
        }
    }

    fn clear_error_entry(&mut self, action: &str) -> bool {
        if self.errors.get(action).is_none() {
            return false;
        }
        Arc::make_mut(&mut self.errors).clear(action)
    }

    fn notify(&self, error: &ActionError) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.notifier.notify(&self.shared.name, error)
        }));
        if let Err(panic_info) = result {
            error!(
                store = %self.shared.name,
                panic = %extract_panic_message(&panic_info),
                "error notifier panicked"
            );
        }
    }

    fn on_set_props(&mut self, props: P) {
        let previous = std::mem::replace(&mut self.props, Arc::new(props));
        self.commit(None);
        debug!(store = %self.shared.name, version = self.version, "props replaced");

        if let Some(hook) = &self.on_props_change {
            let result = catch_unwind(AssertUnwindSafe(|| hook(&*previous, &*self.props, &self.actions)));
            if let Err(panic_info) = result {
                error!(
                    store = %self.shared.name,
                    panic = %extract_panic_message(&panic_info),
                    "props change hook panicked"
                );
            }
        }
    }

    /// Settle everything still pending with `Disposed`.
    fn shutdown(&mut self) {
        debug!(
            store = %self.shared.name,
            running = self.running.len(),
            timers = self.debounce.len(),
            "settling pending work"
        );
        for work in self.debounce.cancel_all() {
            work.cancel();
        }
        for call in self.resolver.drain() {
            call.respond(Err(StoreError::Disposed));
        }
        let mut running: Vec<_> = self.running.drain().collect();
        running.sort_by_key(|(id, _)| *id);
        for (_, invocation) in running {
            invocation.token.cancel();
            invocation.call.respond(Err(StoreError::Disposed));
        }

        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Call(call) = message {
                call.respond(Err(StoreError::Disposed));
            }
        }
    }
}
