//! Stress tests designed to break the dispatch loop.
//!
//! These tests exercise overlapping calls, randomized operation timing,
//! aborts racing completions, and disposal under load.

#[cfg(test)]
mod stress_tests {
    use crate::conflict::ConflictPolicy;
    use crate::error::StoreError;
    use crate::inflight::ActivityTracker;
    use crate::store::{ActionOutcome, Store};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, Default)]
    struct Ledger {
        count: u64,
        applied: Vec<u32>,
        items: Vec<u32>,
    }

    async fn jitter(max_ms: u64) {
        tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=max_ms))).await;
    }

    // ==========================================================================
    // TEST: Concurrent sync calls from many tasks
    // ==========================================================================
    //
    // Every call is one transition; no increment may be lost and every
    // commit must bump the version exactly once.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sync_calls_lose_nothing() {
        let store = Store::builder(Ledger::default)
            .action("inc", |a| a.sync(|s, _: &(), _| s.count += 1))
            .build()
            .unwrap();

        let tasks = 20;
        let per_task = 100;
        let mut handles = vec![];
        for _ in 0..tasks {
            let actions = store.actions().clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..per_task {
                    actions.call("inc", ()).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.state().count, (tasks * per_task) as u64);
        assert_eq!(snapshot.version(), (tasks * per_task) as u64);
    }

    // ==========================================================================
    // TEST: KeepAll ordering survives random operation timing
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keep_all_order_with_random_delays() {
        let store = Store::builder(Ledger::default)
            .action("append", |a| {
                a.asynchronous(|n: u32, _ctx| async move {
                    jitter(5).await;
                    anyhow::Ok(n)
                })
                .effect(|s, _, n: &u32, _| s.applied.push(*n))
                .policy(ConflictPolicy::KeepAll)
            })
            .build()
            .unwrap();

        let calls: Vec<_> = (0..50u32).map(|n| store.actions().call("append", n)).collect();
        for call in calls {
            assert!(call.await.unwrap().is_completed());
        }

        assert_eq!(store.get_state().applied, (0..50).collect::<Vec<_>>());
        assert!(!store.is_loading("append", None));
    }

    // ==========================================================================
    // TEST: Parallel slots settle independently
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_ids_with_random_delays() {
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let store = Store::builder(Ledger::default)
            .action("fetch", {
                let max_concurrent = max_concurrent.clone();
                let current = current.clone();
                move |a| {
                    a.asynchronous(move |id: u32, _ctx| {
                        let max_concurrent = max_concurrent.clone();
                        let current = current.clone();
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            max_concurrent.fetch_max(now, Ordering::SeqCst);
                            jitter(10).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            anyhow::Ok(id)
                        }
                    })
                    .effect(|s, _, id: &u32, _| s.items.push(*id))
                    .parallel(|id: &u32| format!("item-{}", id))
                }
            })
            .build()
            .unwrap();

        let calls: Vec<_> = (0..40u32).map(|id| store.actions().call("fetch", id)).collect();
        for call in calls {
            assert!(call.await.unwrap().is_completed());
        }
        store.wait_idle_timeout(Duration::from_secs(5)).await.unwrap();

        let mut items = store.get_state().items.clone();
        items.sort_unstable();
        assert_eq!(items, (0..40).collect::<Vec<_>>());
        assert!(max_concurrent.load(Ordering::SeqCst) > 1, "parallel slots never overlapped");
        assert!(store.snapshot().loading().is_empty());
    }

    // ==========================================================================
    // TEST: Aborts racing completions settle every call exactly once
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_aborts_settle_each_call_once() {
        let error_effects = Arc::new(AtomicUsize::new(0));

        let store = Store::builder(Ledger::default)
            .action("work", {
                let error_effects = error_effects.clone();
                move |a| {
                    a.asynchronous(|id: u32, _ctx| async move {
                        jitter(8).await;
                        anyhow::Ok(id)
                    })
                    .effect(|s, _, id: &u32, _| s.items.push(*id))
                    .error_effect(move |_, _, err, _| {
                        assert!(err.is_abort());
                        error_effects.fetch_add(1, Ordering::SeqCst);
                    })
                    .parallel(|id: &u32| id.to_string())
                    .abortable()
                }
            })
            .build()
            .unwrap();

        let calls: Vec<_> = (0..60u32).map(|id| store.actions().call("work", id)).collect();
        for id in 0..60u32 {
            if fastrand::bool() {
                store.abort_action("work", Some(&id.to_string()));
            }
            if id % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let mut completed = 0;
        let mut aborted = 0;
        for call in calls {
            match call.await.unwrap() {
                ActionOutcome::Completed(_) => completed += 1,
                ActionOutcome::Aborted => aborted += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        store.wait_idle_timeout(Duration::from_secs(5)).await.unwrap();

        assert_eq!(completed + aborted, 60);
        assert_eq!(error_effects.load(Ordering::SeqCst), aborted);
        assert_eq!(store.get_state().items.len(), completed);
        assert!(store.snapshot().loading().is_empty());
        assert!(store.snapshot().errors().is_empty(), "aborts must not reach the error map");
    }

    // ==========================================================================
    // TEST: Dispose under load resolves every pending caller
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispose_under_load_never_hangs() {
        let store = Store::builder(Ledger::default)
            .action("slow", |a| {
                a.asynchronous(|n: u32, _ctx| async move {
                    jitter(20).await;
                    anyhow::Ok(n)
                })
                .effect(|s, _, n: &u32, _| s.applied.push(*n))
            })
            .build()
            .unwrap();

        let calls: Vec<_> = (0..30u32).map(|n| store.actions().call("slow", n)).collect();
        jitter(15).await;
        store.dispose();

        for call in calls {
            let result = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .expect("caller was never resolved");
            match result {
                Ok(ActionOutcome::Completed(_)) | Err(StoreError::Disposed) => {}
                other => panic!("unexpected result {:?}", other),
            }
        }

        store.wait_idle_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(
            store.actions().call("slow", 99u32).await,
            Err(StoreError::Disposed)
        ));
    }

    // ==========================================================================
    // TEST: Side effects chaining under concurrency
    // ==========================================================================
    //
    // Each "push" side effect calls "count"; nothing may be lost even though
    // the chained calls interleave with fresh calls from other tasks.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_side_effect_chains_interleave_without_loss() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let store = Store::builder(Ledger::default)
            .action("push", |a| {
                a.advanced(|s, n: &u32, _| s.items.push(*n))
                    .side_effect(|ctx| ctx.actions().dispatch("count", ()))
            })
            .action("count", |a| a.sync(|s, _: &(), _| s.count += 1))
            .build()
            .unwrap();

        let _sub = store.subscribe(|s| s.count, {
            let seen = seen.clone();
            move |count| seen.lock().unwrap().push(*count)
        });

        let mut handles = vec![];
        for t in 0..8u32 {
            let actions = store.actions().clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25u32 {
                    actions.call("push", t * 100 + i).await.unwrap();
                    if fastrand::u8(..) % 4 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        store.wait_idle_timeout(Duration::from_secs(5)).await.unwrap();

        let state = store.get_state();
        assert_eq!(state.items.len(), 200);
        assert_eq!(state.count, 200);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 200);
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "notifications out of order");
    }

    // ==========================================================================
    // TEST: Activity tracker under racing guards
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_activity_tracker_race() {
        let tracker = Arc::new(ActivityTracker::new());
        let mut handles = vec![];

        for _ in 0..5000 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let _guard = tracker.guard();
                tokio::task::yield_now().await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(tracker.pending(), 0, "activity tracker leaked guards");
        tracker.wait_idle(Duration::from_millis(100)).await.unwrap();
    }
}
