//! End-to-end scenarios against the public store API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use stately::testing::{init_tracing, Latch, OperationGate, RecordingMiddleware};
use stately::{
    ActionError, ActionOutcome, ConflictPolicy, DerivedDescriptor, EffectPhase, EngineConfig,
    OperationContext, OptimisticMiddleware, Store, StoreError,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct Board {
    count: i64,
    label: String,
    items: Vec<u32>,
    liked: bool,
    saving: bool,
}

type Ctx = OperationContext<Board, ()>;

/// An operation that echoes its argument once the gate lets it through.
fn gated_load(
    gate: &OperationGate,
) -> impl Fn(u32, Ctx) -> BoxFuture<'static, anyhow::Result<u32>> + Send + Sync + 'static {
    let gate = gate.clone();
    move |n: u32, _ctx: Ctx| {
        let gate = gate.clone();
        async move {
            gate.pass().await;
            anyhow::Ok(n)
        }
        .boxed()
    }
}

/// An operation that fails once the gate lets it through.
fn gated_reject(
    gate: &OperationGate,
) -> impl Fn(u32, Ctx) -> BoxFuture<'static, anyhow::Result<u32>> + Send + Sync + 'static {
    let gate = gate.clone();
    move |n: u32, _ctx: Ctx| {
        let gate = gate.clone();
        async move {
            gate.pass().await;
            Err::<u32, _>(anyhow::anyhow!("request {} rejected", n))
        }
        .boxed()
    }
}

// =============================================================================
// Sync actions & subscriptions
// =============================================================================

#[tokio::test]
async fn counter_increments_notify_once_each() {
    init_tracing();
    let store = Store::builder(Board::default)
        .action("inc", |a| a.sync(|s, by: &i64, _| s.count += *by))
        .build()
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = store.subscribe(|s| s.count, {
        let seen = seen.clone();
        move |count| seen.lock().unwrap().push(*count)
    });

    for _ in 0..3 {
        let outcome = store.actions().call("inc", 1i64).await.unwrap();
        assert!(outcome.state::<Board>().is_some());
    }

    assert_eq!(store.get_state().count, 3);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn async_counter_called_concurrently_notifies_three_times() {
    let store = Store::builder(Board::default)
        .action("counter", |a| {
            a.asynchronous(|_: (), _ctx| async {
                tokio::time::sleep(Duration::ZERO).await;
                anyhow::Ok(())
            })
            .effect(|s, _, _: &(), _| s.count += 1)
            .policy(ConflictPolicy::KeepAll)
        })
        .build()
        .unwrap();

    let notifications = Arc::new(AtomicUsize::new(0));
    let _sub = store
        .subscribe_keys(["count"], {
            let notifications = notifications.clone();
            move |_| {
                notifications.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let calls: Vec<_> = (0..3).map(|_| store.actions().call("counter", ())).collect();
    for outcome in futures::future::join_all(calls).await {
        assert!(outcome.unwrap().is_completed());
    }

    assert_eq!(store.get_state().count, 3);
    assert_eq!(notifications.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_sync_effect_keeps_committed_state() {
    let store = Store::builder(Board::default)
        .action("rename", |a| {
            a.sync(|s, label: &String, _| -> anyhow::Result<()> {
                anyhow::ensure!(!label.is_empty(), "label required");
                s.label = label.clone();
                Ok(())
            })
        })
        .build()
        .unwrap();

    store.actions().call("rename", "first".to_string()).await.unwrap();
    let version = store.snapshot().version();

    let err = store.actions().call("rename", String::new()).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Effect {
            phase: EffectPhase::Sync,
            ..
        }
    ));
    assert_eq!(store.get_state().label, "first");
    assert_eq!(store.snapshot().version(), version);
}

#[tokio::test]
async fn key_observer_ignores_unselected_fields() {
    let store = Store::builder(Board::default)
        .action("inc", |a| a.sync(|s, _: &(), _| s.count += 1))
        .action("relabel", |a| a.sync(|s, label: &String, _| s.label = label.clone()))
        .build()
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = store
        .subscribe_keys(["count"], {
            let seen = seen.clone();
            move |selection| seen.lock().unwrap().push(selection.field::<i64>("count"))
        })
        .unwrap();

    store.actions().call("relabel", "x".to_string()).await.unwrap();
    store.actions().call("relabel", "y".to_string()).await.unwrap();
    assert!(seen.lock().unwrap().is_empty());

    store.actions().call("inc", ()).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![Some(1)]);
}

#[tokio::test]
async fn unknown_selector_key_is_rejected() {
    let store = Store::builder(Board::default).build().unwrap();
    let result = store.subscribe_keys(["nope"], |_| {});
    assert!(matches!(result, Err(StoreError::UnknownSelectorKey { key }) if key == "nope"));
}

#[tokio::test]
async fn loading_key_observer_follows_in_flight_state() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("load", |a| a.asynchronous(gated_load(&gate)))
        .build()
        .unwrap();

    let by_key = Arc::new(Mutex::new(Vec::new()));
    let _keys = store
        .subscribe_keys(["loading:load"], {
            let by_key = by_key.clone();
            move |sel| by_key.lock().unwrap().push(sel.loading("loading:load"))
        })
        .unwrap();
    let by_snapshot = Arc::new(Mutex::new(Vec::new()));
    let _snapshot = store.subscribe_snapshot(|snap| snap.is_loading("load", None), {
        let by_snapshot = by_snapshot.clone();
        move |loading| by_snapshot.lock().unwrap().push(*loading)
    });

    let call = store.actions().call("load", 1u32);
    gate.wait_entered(1).await;
    assert_eq!(*by_key.lock().unwrap(), vec![Some(true)]);

    gate.release(1);
    call.await.unwrap();
    assert_eq!(*by_key.lock().unwrap(), vec![Some(true), Some(false)]);
    assert_eq!(*by_snapshot.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn error_key_observer_sees_record_and_clear() {
    let store = Store::builder(Board::default)
        .action("load", |a| {
            a.asynchronous(|_: (), _ctx| async { Err::<(), _>(anyhow::anyhow!("offline")) })
                .error_managed()
        })
        .build()
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = store
        .subscribe_keys(["error:load"], {
            let seen = seen.clone();
            move |sel| seen.lock().unwrap().push(sel.error("error:load").cloned())
        })
        .unwrap();

    let outcome = store.actions().call("load", ()).await.unwrap();
    let error = outcome.error().cloned().unwrap();
    store.clear_error("load").await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some(error), None]);
}

#[tokio::test]
async fn dropping_subscription_stops_notifications() {
    let store = Store::builder(Board::default)
        .action("inc", |a| a.sync(|s, _: &(), _| s.count += 1))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let sub = store.subscribe(|s| s.count, {
        let calls = calls.clone();
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    });

    store.actions().call("inc", ()).await.unwrap();
    sub.unsubscribe();
    store.actions().call("inc", ()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Derived state
// =============================================================================

#[tokio::test]
async fn derived_recomputes_only_when_deps_change() {
    let computes = Arc::new(AtomicUsize::new(0));
    let store = Store::builder(Board::default)
        .action("push", |a| a.sync(|s, n: &u32, _| s.items.push(*n)))
        .action("relabel", |a| a.sync(|s, label: &String, _| s.label = label.clone()))
        .derived(DerivedDescriptor::new(
            "total",
            |s: &Board, _: &()| s.items.clone(),
            {
                let computes = computes.clone();
                move |items: &Vec<u32>| {
                    computes.fetch_add(1, Ordering::SeqCst);
                    items.iter().sum::<u32>()
                }
            },
        ))
        .build()
        .unwrap();

    assert_eq!(computes.load(Ordering::SeqCst), 1);
    assert_eq!(store.derived::<u32>("total").as_deref(), Some(&0));

    store.actions().call("relabel", "unrelated".to_string()).await.unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 1);

    store.actions().call("push", 4u32).await.unwrap();
    store.actions().call("push", 5u32).await.unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 3);
    assert_eq!(store.derived::<u32>("total").as_deref(), Some(&9));
}

#[tokio::test]
async fn derived_key_observer_sees_new_value() {
    let store = Store::builder(Board::default)
        .action("push", |a| a.sync(|s, n: &u32, _| s.items.push(*n)))
        .derived(DerivedDescriptor::new("size", |s: &Board, _: &()| s.items.len(), |n: &usize| *n))
        .build()
        .unwrap();

    let latch = Latch::new(1);
    let seen = Arc::new(Mutex::new(None));
    let _sub = store
        .subscribe_keys(["size"], {
            let latch = latch.clone();
            let seen = seen.clone();
            move |selection| {
                *seen.lock().unwrap() = selection.derived::<usize>("size").map(|n| *n);
                latch.count_down();
            }
        })
        .unwrap();

    store.actions().call("push", 1u32).await.unwrap();
    latch.wait().await;
    assert_eq!(*seen.lock().unwrap(), Some(1));
}

// =============================================================================
// Conflict policies
// =============================================================================

#[tokio::test]
async fn keep_all_runs_in_call_order() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("load", |a| {
            a.asynchronous(gated_load(&gate))
                .effect(|s, _, n: &u32, _| s.items.push(*n))
                .policy(ConflictPolicy::KeepAll)
        })
        .build()
        .unwrap();

    let calls: Vec<_> = (1..=3u32).map(|n| store.actions().call("load", n)).collect();
    gate.wait_entered(1).await;
    assert!(store.is_loading("load", None));
    gate.release(3);

    for call in calls {
        assert!(call.await.unwrap().is_completed());
    }
    assert_eq!(store.get_state().items, vec![1, 2, 3]);
    assert!(!store.is_loading("load", None));
}

#[tokio::test]
async fn keep_last_supersedes_queued_calls() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("load", |a| {
            a.asynchronous(gated_load(&gate))
                .effect(|s, _, n: &u32, _| s.items.push(*n))
                .policy(ConflictPolicy::KeepLast)
        })
        .build()
        .unwrap();

    let first = store.actions().call("load", 1u32);
    gate.wait_entered(1).await;
    let second = store.actions().call("load", 2u32);
    let third = store.actions().call("load", 3u32);

    assert!(matches!(second.await.unwrap(), ActionOutcome::Superseded));
    gate.release(2);
    assert_eq!(first.await.unwrap().value::<u32>(), Some(&1));
    assert_eq!(third.await.unwrap().value::<u32>(), Some(&3));
    assert_eq!(store.get_state().items, vec![1, 3]);
}

#[tokio::test]
async fn ignore_drops_calls_while_busy() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("load", |a| {
            a.asynchronous(gated_load(&gate))
                .effect(|s, _, n: &u32, _| s.items.push(*n))
                .policy(ConflictPolicy::Ignore)
        })
        .build()
        .unwrap();

    let first = store.actions().call("load", 1u32);
    gate.wait_entered(1).await;
    let second = store.actions().call("load", 2u32);
    assert!(matches!(second.await.unwrap(), ActionOutcome::Dropped));

    gate.release(1);
    assert!(first.await.unwrap().is_completed());
    assert_eq!(store.get_state().items, vec![1]);
}

#[tokio::test]
async fn reject_returns_conflict_while_busy() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("load", |a| a.asynchronous(gated_load(&gate)).policy(ConflictPolicy::Reject))
        .build()
        .unwrap();

    let first = store.actions().call("load", 1u32);
    gate.wait_entered(1).await;
    let err = store.actions().call("load", 2u32).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { action, .. } if action == "load"));
    assert!(store.is_loading("load", None), "rejected call must not touch the running slot");

    gate.release(1);
    assert!(first.await.unwrap().is_completed());
}

#[tokio::test]
async fn parallel_runs_distinct_ids_together() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("fetch", |a| {
            a.asynchronous(gated_load(&gate))
                .effect(|s, _, n: &u32, _| s.items.push(*n))
                .parallel(|n: &u32| format!("id-{}", n % 10))
        })
        .build()
        .unwrap();

    let a = store.actions().call("fetch", 1u32);
    let b = store.actions().call("fetch", 2u32);
    let a_again = store.actions().call("fetch", 11u32);
    gate.wait_entered(2).await;

    assert!(store.is_loading("fetch", Some("id-1")));
    assert!(store.is_loading("fetch", Some("id-2")));
    tokio::task::yield_now().await;
    assert_eq!(gate.entered(), 2, "same id must queue behind the running call");

    gate.release(3);
    for call in [a, b, a_again] {
        assert!(call.await.unwrap().is_completed());
    }
    assert!(store.snapshot().loading().is_empty());
}

#[tokio::test]
async fn default_policy_comes_from_config() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .with_config(EngineConfig::default().with_default_policy(ConflictPolicy::Reject))
        .action("load", |a| a.asynchronous(gated_load(&gate)))
        .build()
        .unwrap();

    let first = store.actions().call("load", 1u32);
    gate.wait_entered(1).await;
    assert!(matches!(
        store.actions().call("load", 2u32).await,
        Err(StoreError::Conflict { .. })
    ));
    gate.release(1);
    first.await.unwrap();
}

// =============================================================================
// Async lifecycle
// =============================================================================

#[tokio::test]
async fn pre_effect_commits_before_operation_runs() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("save", |a| {
            a.asynchronous(gated_load(&gate))
                .pre_effect(|s, _, _| s.saving = true)
                .effect(|s, _, _: &u32, _| s.saving = false)
        })
        .build()
        .unwrap();

    let call = store.actions().call("save", 1u32);
    gate.wait_entered(1).await;
    assert!(store.get_state().saving);
    assert!(store.is_loading("save", None));

    gate.release(1);
    call.await.unwrap();
    assert!(!store.get_state().saving);
    assert!(!store.is_loading("save", None));
}

#[tokio::test]
async fn optimistic_update_rolls_back_with_middleware() {
    let optimistic = Arc::new(OptimisticMiddleware::new());
    let store = Store::builder(Board::default)
        .middleware(optimistic.clone())
        .action("like", |a| {
            a.asynchronous(|_: (), _ctx| async { Err::<(), _>(anyhow::anyhow!("server said no")) })
                .optimistic(|s, _, _| s.liked = true)
                .error_effect(|s, _, _, _| s.label = "retry".to_string())
        })
        .build()
        .unwrap();

    let outcome = store.actions().call("like", ()).await.unwrap();
    assert!(matches!(outcome, ActionOutcome::Failed(_)));

    let state = store.get_state();
    assert!(!state.liked, "optimistic change should be reverted");
    assert_eq!(state.label, "retry");
    assert_eq!(optimistic.rollbacks(), 1);
}

#[tokio::test]
async fn rollback_keeps_transitions_committed_in_flight() {
    let gate = OperationGate::new();
    let recorder = RecordingMiddleware::new();
    let store = Store::builder(Board::default)
        .middleware(OptimisticMiddleware::new())
        .middleware(recorder.clone())
        .action("like", |a| {
            a.asynchronous(gated_reject(&gate))
                .optimistic(|s, _, _| s.liked = true)
                .error_managed()
        })
        .action("inc", |a| a.sync(|s, _: &(), _| s.count += 1))
        .build()
        .unwrap();

    let like = store.actions().call("like", 7u32);
    gate.wait_entered(1).await;
    assert!(store.get_state().liked);

    store.actions().call("inc", ()).await.unwrap();
    assert_eq!(store.get_state().count, 1);

    gate.release(1);
    assert!(matches!(like.await.unwrap(), ActionOutcome::Failed(_)));

    let state = store.get_state();
    assert!(!state.liked, "optimistic change should be reverted");
    assert_eq!(state.count, 1, "increment committed while in flight must survive");

    let rollback = &recorder.recorded_for("rollback")[0];
    assert_eq!(rollback.args::<u32>(), Some(&7));
    assert_eq!(rollback.operation_id.as_deref(), Some("default"));
    assert!(rollback.before::<Board>().unwrap().liked);
    assert_eq!(rollback.after::<Board>().unwrap().count, 1);

    let error = &recorder.recorded_for("error")[0];
    assert_eq!(error.args::<u32>(), Some(&7));
    assert!(error.before::<Board>().unwrap().liked);
    assert_eq!(error.after::<Board>(), Some(&*state));
}

#[tokio::test]
async fn overlapping_rollbacks_never_resurrect_each_other() {
    let (first_gate, second_gate) = (OperationGate::new(), OperationGate::new());
    let optimistic = Arc::new(OptimisticMiddleware::new());
    let store = Store::builder(Board::default)
        .middleware(optimistic.clone())
        .action("like", {
            let (first_gate, second_gate) = (first_gate.clone(), second_gate.clone());
            move |a| {
                a.asynchronous(move |id: u32, _ctx: Ctx| {
                    let gate = if id == 1 { first_gate.clone() } else { second_gate.clone() };
                    async move {
                        gate.pass().await;
                        Err::<u32, _>(anyhow::anyhow!("like {} rejected", id))
                    }
                })
                .optimistic(|s, _, _| s.count += 1)
                .parallel(|id: &u32| id.to_string())
                .error_managed()
            }
        })
        .build()
        .unwrap();

    let first = store.actions().call("like", 1u32);
    let second = store.actions().call("like", 2u32);
    first_gate.wait_entered(1).await;
    second_gate.wait_entered(1).await;
    assert_eq!(store.get_state().count, 2);

    first_gate.release(1);
    assert!(matches!(first.await.unwrap(), ActionOutcome::Failed(_)));
    assert_eq!(store.get_state().count, 1, "only the first like is reverted");

    second_gate.release(1);
    assert!(matches!(second.await.unwrap(), ActionOutcome::Failed(_)));
    assert_eq!(store.get_state().count, 0, "the first rollback must not come back");
    assert_eq!(optimistic.rollbacks(), 2);
}

#[tokio::test]
async fn optimistic_update_stays_without_middleware() {
    let store = Store::builder(Board::default)
        .action("like", |a| {
            a.asynchronous(|_: (), _ctx| async { Err::<(), _>(anyhow::anyhow!("server said no")) })
                .optimistic(|s, _, _| s.liked = true)
                .error_managed()
        })
        .build()
        .unwrap();

    store.actions().call("like", ()).await.unwrap();
    assert!(store.get_state().liked);
}

#[tokio::test]
async fn failure_is_recorded_and_notified() {
    let notified = Arc::new(Mutex::new(Vec::new()));
    let store = Store::builder(Board::default)
        .name("board")
        .notify_error({
            let notified = notified.clone();
            move |store: &str, error: &ActionError| {
                notified.lock().unwrap().push(format!("{}/{}", store, error.action()))
            }
        })
        .action("load", |a| {
            a.asynchronous(|_: (), _ctx| async { Err::<(), _>(anyhow::anyhow!("offline")) })
        })
        .build()
        .unwrap();

    let outcome = store.actions().call("load", ()).await.unwrap();
    let error = outcome.error().cloned().unwrap();
    assert!(!error.is_abort());
    assert_eq!(store.get_error("load"), Some(error));
    assert_eq!(*notified.lock().unwrap(), vec!["board/load".to_string()]);

    store.clear_error("load").await.unwrap();
    assert!(store.get_error("load").is_none());
}

#[tokio::test]
async fn handled_errors_skip_the_notifier() {
    let notified = Arc::new(AtomicUsize::new(0));
    let store = Store::builder(Board::default)
        .notify_error({
            let notified = notified.clone();
            move |_: &str, _: &ActionError| {
                notified.fetch_add(1, Ordering::SeqCst);
            }
        })
        .action("managed", |a| {
            a.asynchronous(|_: (), _ctx| async { Err::<(), _>(anyhow::anyhow!("x")) })
                .error_managed()
        })
        .action("handled", |a| {
            a.asynchronous(|_: (), _ctx| async { Err::<(), _>(anyhow::anyhow!("y")) })
                .error_effect(|s, _, _, _| s.label = "failed".to_string())
        })
        .build()
        .unwrap();

    store.actions().call("managed", ()).await.unwrap();
    store.actions().call("handled", ()).await.unwrap();

    assert_eq!(notified.load(Ordering::SeqCst), 0);
    assert!(store.get_error("managed").is_some());
    assert!(store.get_error("handled").is_some());
}

#[tokio::test]
async fn success_clears_previous_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let store = Store::builder(Board::default)
        .action("flaky", {
            let attempts = attempts.clone();
            move |a| {
                a.asynchronous(move |_: (), _ctx| {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        anyhow::ensure!(attempt > 0, "first attempt fails");
                        Ok(())
                    }
                })
                .error_managed()
            }
        })
        .build()
        .unwrap();

    store.actions().call("flaky", ()).await.unwrap();
    assert!(store.get_error("flaky").is_some());
    store.actions().call("flaky", ()).await.unwrap();
    assert!(store.get_error("flaky").is_none());
}

#[tokio::test]
async fn abort_is_quiet() {
    let gate = OperationGate::new();
    let recorder = RecordingMiddleware::new();
    let notified = Arc::new(AtomicUsize::new(0));
    let store = Store::builder(Board::default)
        .middleware(recorder.clone())
        .notify_error({
            let notified = notified.clone();
            move |_: &str, _: &ActionError| {
                notified.fetch_add(1, Ordering::SeqCst);
            }
        })
        .action("load", |a| a.asynchronous(gated_load(&gate)).abortable())
        .build()
        .unwrap();

    let call = store.actions().call("load", 1u32);
    gate.wait_entered(1).await;
    store.abort_action("load", None);

    assert!(matches!(call.await.unwrap(), ActionOutcome::Aborted));
    assert!(store.get_error("load").is_none());
    assert!(!store.is_loading("load", None));
    assert_eq!(notified.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.events_with_prefix("abort:"), vec!["abort:load#default"]);

    let abort = &recorder.recorded_for("abort")[0];
    assert_eq!(abort.args::<u32>(), Some(&1));
    assert_eq!(abort.operation_id.as_deref(), Some("default"));
    assert!(abort.before::<Board>().is_some());
}

#[tokio::test]
async fn abort_is_ignored_for_non_abortable_actions() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("load", |a| a.asynchronous(gated_load(&gate)))
        .build()
        .unwrap();

    let call = store.actions().call("load", 7u32);
    gate.wait_entered(1).await;
    store.abort_action("load", None);
    gate.release(1);

    assert_eq!(call.await.unwrap().value::<u32>(), Some(&7));
}

// =============================================================================
// Side effects & debounce
// =============================================================================

#[tokio::test]
async fn side_effects_chain_into_other_actions() {
    let store = Store::builder(Board::default)
        .action("add", |a| {
            a.asynchronous(|n: u32, _ctx| async move { anyhow::Ok(n) })
                .effect(|s, _, n: &u32, _| s.items.push(*n))
                .side_effect(|ctx, _: &u32| ctx.actions().dispatch("recount", ()))
        })
        .action("recount", |a| a.sync(|s, _: &(), _| s.count = s.items.len() as i64))
        .build()
        .unwrap();

    store.actions().call("add", 1u32).await.unwrap();
    store.actions().call("add", 2u32).await.unwrap();
    store.wait_idle().await.unwrap();

    assert_eq!(store.get_state().count, 2);
}

#[tokio::test(start_paused = true)]
async fn debounced_invocation_runs_last_call_only() {
    let runs = Arc::new(AtomicUsize::new(0));
    let store = Store::builder(Board::default)
        .action("search", {
            let runs = runs.clone();
            move |a| {
                a.asynchronous(move |n: u32, _ctx| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async move { anyhow::Ok(n) }
                })
                .effect(|s, _, n: &u32, _| s.items.push(*n))
                .debounce(Duration::from_millis(100))
            }
        })
        .build()
        .unwrap();

    let first = store.actions().call("search", 1u32);
    let second = store.actions().call("search", 2u32);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let third = store.actions().call("search", 3u32);

    assert!(matches!(first.await.unwrap(), ActionOutcome::Superseded));
    assert!(matches!(second.await.unwrap(), ActionOutcome::Superseded));
    assert_eq!(third.await.unwrap().value::<u32>(), Some(&3));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_state().items, vec![3]);
}

#[tokio::test(start_paused = true)]
async fn debounced_side_effect_fires_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let store = Store::builder(Board::default)
        .action("type", |a| {
            let fired = fired.clone();
            a.advanced(|s, c: &char, _| s.label.push(*c))
                .side_effect(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .debounce_side_effects(Duration::from_millis(200))
        })
        .build()
        .unwrap();

    for c in "abc".chars() {
        store.actions().call("type", c).await.unwrap();
    }
    assert_eq!(store.get_state().label, "abc");
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    store.wait_idle().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Props & lifecycle hooks
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    min: u32,
}

#[tokio::test]
async fn props_feed_initial_state_derived_and_hooks() {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let store = Store::builder_with_props(Filter { min: 2 }, |props: &Filter| Board {
        count: props.min as i64,
        items: vec![1, 2, 3, 4],
        ..Board::default()
    })
    .derived(DerivedDescriptor::new(
        "visible",
        |s: &Board, p: &Filter| (s.items.clone(), p.min),
        |(items, min): &(Vec<u32>, u32)| items.iter().filter(|n| **n >= *min).count(),
    ))
    .action("sync_min", |a| a.sync(|s, _: &(), p: &Filter| s.count = p.min as i64))
    .on_props_change({
        let changes = changes.clone();
        move |old: &Filter, new: &Filter, actions| {
            changes.lock().unwrap().push((old.min, new.min));
            let _ = actions.dispatch("sync_min", ());
        }
    })
    .build()
    .unwrap();

    assert_eq!(store.get_state().count, 2);
    assert_eq!(store.derived::<usize>("visible").as_deref(), Some(&3));

    store.set_props(Filter { min: 4 }).await.unwrap();
    store.wait_idle().await.unwrap();

    assert_eq!(store.derived::<usize>("visible").as_deref(), Some(&1));
    assert_eq!(store.get_state().count, 4);
    assert_eq!(*changes.lock().unwrap(), vec![(2, 4)]);
}

#[tokio::test]
async fn on_mount_can_dispatch() {
    let store = Store::builder(Board::default)
        .action("inc", |a| a.sync(|s, _: &(), _| s.count += 1))
        .on_mount(|actions, _| {
            let _ = actions.dispatch("inc", ());
        })
        .build()
        .unwrap();

    store.wait_idle().await.unwrap();
    assert_eq!(store.get_state().count, 1);
}

#[tokio::test]
async fn dispose_resolves_pending_and_rejects_new_calls() {
    let gate = OperationGate::new();
    let store = Store::builder(Board::default)
        .action("load", |a| a.asynchronous(gated_load(&gate)))
        .build()
        .unwrap();

    let running = store.actions().call("load", 1u32);
    let queued = store.actions().call("load", 2u32);
    gate.wait_entered(1).await;

    store.dispose();
    store.dispose();
    assert!(store.is_disposed());

    assert!(matches!(running.await, Err(StoreError::Disposed)));
    assert!(matches!(queued.await, Err(StoreError::Disposed)));
    assert!(matches!(
        store.actions().call("load", 3u32).await,
        Err(StoreError::Disposed)
    ));
    assert!(matches!(store.set_props(()).await, Err(StoreError::Disposed)));
}

// =============================================================================
// Middleware & call errors
// =============================================================================

#[tokio::test]
async fn middleware_records_and_blocks() {
    let recorder = RecordingMiddleware::new();
    let store = Store::builder(Board::default)
        .middleware(recorder.clone())
        .action("inc", |a| a.sync(|s, _: &(), _| s.count += 1))
        .build()
        .unwrap();

    store.actions().call("inc", ()).await.unwrap();
    assert_eq!(recorder.events(), vec!["dispatch:inc", "effect:inc:sync"]);
    let effect = &recorder.recorded_for("effect")[0];
    assert_eq!(effect.phase, Some(EffectPhase::Sync));
    assert_eq!(effect.args::<()>(), Some(&()));
    assert_eq!(effect.before::<Board>().map(|b| b.count), Some(0));
    assert_eq!(effect.after::<Board>().map(|b| b.count), Some(1));

    recorder.halt_action("inc");
    let outcome = store.actions().call("inc", ()).await.unwrap();
    assert!(matches!(outcome, ActionOutcome::Blocked { .. }));
    assert_eq!(store.get_state().count, 1);
}

#[tokio::test]
async fn call_errors_are_immediate() {
    let store = Store::builder(Board::default)
        .action("inc", |a| a.sync(|s, by: &i64, _| s.count += *by))
        .build()
        .unwrap();

    assert!(matches!(
        store.actions().call("missing", ()).await,
        Err(StoreError::UnknownAction { action }) if action == "missing"
    ));
    assert!(matches!(
        store.actions().call("inc", "one").await,
        Err(StoreError::ArgumentTypeMismatch { action, .. }) if action == "inc"
    ));
    assert_eq!(store.get_state().count, 0);
}

// =============================================================================
// Build-time validation
// =============================================================================

#[tokio::test]
async fn build_rejects_bad_configuration() {
    let empty = Store::builder(Board::default)
        .action("", |a| a.sync(|_, _: &(), _| {}))
        .build();
    assert!(matches!(empty, Err(StoreError::EmptyName)));

    let duplicate = Store::builder(Board::default)
        .action("inc", |a| a.sync(|_, _: &(), _| {}))
        .action("inc", |a| a.sync(|_, _: &(), _| {}))
        .build();
    assert!(matches!(duplicate, Err(StoreError::DuplicateAction { action }) if action == "inc"));

    let collision = Store::builder(Board::default)
        .action("total", |a| a.sync(|_, _: &(), _| {}))
        .derived(DerivedDescriptor::new("total", |s: &Board, _: &()| s.count, |c: &i64| *c))
        .build();
    assert!(matches!(collision, Err(StoreError::NameCollision { name }) if name == "total"));

    let twice = Store::builder(Board::default)
        .derived(DerivedDescriptor::new("n", |s: &Board, _: &()| s.count, |c: &i64| *c))
        .derived(DerivedDescriptor::new("n", |s: &Board, _: &()| s.count, |c: &i64| *c))
        .build();
    assert!(matches!(twice, Err(StoreError::DuplicateDerived { name }) if name == "n"));

    let invalid = Store::builder(Board::default)
        .action("load", |a| {
            a.asynchronous(|n: u32, _ctx| async move { anyhow::Ok(n) })
                .policy(ConflictPolicy::Parallel)
        })
        .build();
    assert!(matches!(invalid, Err(StoreError::InvalidDescriptor { .. })));
    assert!(invalid.unwrap_err().is_configuration());
}

#[test]
fn build_outside_runtime_fails() {
    let result = Store::builder(Board::default).build();
    assert!(matches!(result, Err(StoreError::NoRuntime)));
}
