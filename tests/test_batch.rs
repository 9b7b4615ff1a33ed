//! Batch orchestrator test suite
//!
//! Exercises batch discovery, concurrent fan-out, result caching, and
//! per-task failure isolation inside a single request scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use lazybatch::{
    current_scope, get_data, register_fn, run_scoped, Context, Phase, RequestHandle,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::{sleep, Duration, Instant};

fn request_context() -> Context {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    Context::create(
        HashMap::new(),
        RequestHandle::new("http", "localhost", "/render"),
        None,
    )
}

/// Three producers with 100ms/50ms/75ms delays, each `get_data` fully
/// awaited before the next is issued. Wall time is the longest delay, not
/// the sum: the first call waits for registration silence and fans out the
/// whole frozen batch at once.
#[tokio::test(start_paused = true)]
async fn test_batch_runs_producers_in_parallel() {
    run_scoped(request_context(), async {
        for (task_id, delay_ms) in [("a", 100u64), ("b", 50), ("c", 75)] {
            register_fn(task_id, move |_ctx| async move {
                sleep(Duration::from_millis(delay_ms)).await;
                Ok(json!(delay_ms))
            });
        }

        let started = Instant::now();
        let a = get_data("a").await.unwrap().unwrap();
        let b = get_data("b").await.unwrap().unwrap();
        let c = get_data("c").await.unwrap().unwrap();
        let elapsed = started.elapsed();

        assert_eq!(*a, json!(100));
        assert_eq!(*b, json!(50));
        assert_eq!(*c, json!(75));
        assert!(
            elapsed >= Duration::from_millis(100),
            "cannot finish before the longest producer"
        );
        assert!(
            elapsed < Duration::from_millis(225),
            "producers ran serially: {:?}",
            elapsed
        );
    })
    .await;
}

/// Producers issued before the batch freezes all start within the same
/// scheduling epoch of each other.
#[tokio::test(start_paused = true)]
async fn test_producer_start_skew_is_bounded() {
    let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    run_scoped(request_context(), async {
        for (task_id, delay_ms) in [("x", 30u64), ("y", 10), ("z", 20)] {
            let starts = Arc::clone(&starts);
            register_fn(task_id, move |_ctx| {
                let starts = Arc::clone(&starts);
                async move {
                    starts.lock().unwrap().push(Instant::now());
                    sleep(Duration::from_millis(delay_ms)).await;
                    Ok(json!(task_id))
                }
            });
        }
        let (x, y, z) = tokio::join!(get_data("x"), get_data("y"), get_data("z"));
        assert!(x.is_ok() && y.is_ok() && z.is_ok());
    })
    .await;

    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    let earliest = *starts.iter().min().unwrap();
    let latest = *starts.iter().max().unwrap();
    assert!(
        latest - earliest < Duration::from_millis(5),
        "start skew too large: {:?}",
        latest - earliest
    );
}

/// Three concurrent callers of the same task id fold into one batch and
/// share a single producer invocation.
#[tokio::test]
async fn test_concurrent_callers_share_one_invocation() {
    let invocations = Arc::new(AtomicU32::new(0));

    run_scoped(request_context(), async {
        let counter = Arc::clone(&invocations);
        register_fn("slow", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                Ok(json!("shared"))
            }
        });

        let (r1, r2, r3) = tokio::join!(get_data("slow"), get_data("slow"), get_data("slow"));
        let v1 = r1.unwrap().unwrap();
        let v2 = r2.unwrap().unwrap();
        let v3 = r3.unwrap().unwrap();
        assert_eq!(*v1, json!("shared"));
        assert!(Arc::ptr_eq(&v1, &v2));
        assert!(Arc::ptr_eq(&v2, &v3));
    })
    .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

/// Repeated `get_data` for a settled id returns the identical cached
/// allocation without re-invoking the producer.
#[tokio::test]
async fn test_settled_results_are_referentially_idempotent() {
    let invocations = Arc::new(AtomicU32::new(0));

    run_scoped(request_context(), async {
        let counter = Arc::clone(&invocations);
        register_fn("page", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "title": "home" }))
            }
        });

        let first = get_data("page").await.unwrap().unwrap();
        let second = get_data("page").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    })
    .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

/// A failing producer rejects its own callers with the cached failure and
/// is never retried.
#[tokio::test]
async fn test_failures_are_cached_and_not_retried() {
    let invocations = Arc::new(AtomicU32::new(0));

    run_scoped(request_context(), async {
        let counter = Arc::clone(&invocations);
        register_fn("fails", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("boom"))
            }
        });

        let first = get_data("fails").await.unwrap_err();
        assert!(first.to_string().contains("boom"));
        assert_eq!(first.task_id(), Some("fails"));

        let second = get_data("fails").await.unwrap_err();
        assert_eq!(first, second);
    })
    .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

/// One producer's failure never affects siblings in the same batch.
#[tokio::test]
async fn test_failure_is_isolated_to_its_task_id() {
    run_scoped(request_context(), async {
        register_fn("bad", |_ctx| async { Err(anyhow::anyhow!("nope")) });
        register_fn("good", |_ctx| async { Ok(json!("fine")) });

        let (bad, good) = tokio::join!(get_data("bad"), get_data("good"));
        assert!(bad.is_err());
        assert_eq!(*good.unwrap().unwrap(), json!("fine"));
    })
    .await;
}

/// A panicking producer is contained the same way a failing one is.
#[tokio::test]
async fn test_panicking_producer_is_contained() {
    run_scoped(request_context(), async {
        register_fn("explodes", |_ctx| async { panic!("kaboom") });
        register_fn("calm", |_ctx| async { Ok(json!("ok")) });

        let (exploded, calm) = tokio::join!(get_data("explodes"), get_data("calm"));
        let err = exploded.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert_eq!(*calm.unwrap().unwrap(), json!("ok"));
    })
    .await;
}

/// An id nobody ever registers resolves to `None` rather than erroring.
#[tokio::test]
async fn test_unregistered_id_resolves_to_none() {
    run_scoped(request_context(), async {
        assert_eq!(get_data("missing").await.unwrap(), None);
    })
    .await;
}

/// A task registered only after the first batch settled triggers a new,
/// smaller cycle; already-settled ids are not re-executed.
#[tokio::test]
async fn test_late_arrival_starts_restricted_cycle() {
    let early_runs = Arc::new(AtomicU32::new(0));
    let late_runs = Arc::new(AtomicU32::new(0));

    run_scoped(request_context(), async {
        let counter = Arc::clone(&early_runs);
        register_fn("early", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("early"))
            }
        });

        let early = get_data("early").await.unwrap().unwrap();
        assert_eq!(*early, json!("early"));

        // First batch has settled; this registration arrives too late for it.
        let counter = Arc::clone(&late_runs);
        register_fn("late", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("late"))
            }
        });

        let late = get_data("late").await.unwrap().unwrap();
        assert_eq!(*late, json!("late"));

        // The second cycle did not re-run the settled producer.
        let replay = get_data("early").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&early, &replay));

        let orchestrator = current_scope().unwrap().orchestrator().clone();
        assert_eq!(orchestrator.phase().await, Phase::Settled);
        assert!(orchestrator.is_settled("early"));
        assert!(orchestrator.is_settled("late"));
        let mut requested = orchestrator.requested_ids();
        requested.sort();
        assert_eq!(requested, vec!["early", "late"]);
    })
    .await;

    assert_eq!(early_runs.load(Ordering::SeqCst), 1);
    assert_eq!(late_runs.load(Ordering::SeqCst), 1);
}

/// Producers can share a context-level deduped fetch within one batch.
#[tokio::test]
async fn test_producers_share_deduped_fetch() {
    let fetches = Arc::new(AtomicU32::new(0));

    run_scoped(request_context(), async {
        for task_id in ["header", "footer"] {
            let fetches = Arc::clone(&fetches);
            register_fn(task_id, move |ctx| {
                let fetches = Arc::clone(&fetches);
                async move {
                    let session = ctx
                        .dedupe("session", move || {
                            let fetches = Arc::clone(&fetches);
                            async move {
                                fetches.fetch_add(1, Ordering::SeqCst);
                                sleep(Duration::from_millis(5)).await;
                                Ok(json!({ "user": "ada" }))
                            }
                        })
                        .await?;
                    Ok(json!({ "task": task_id, "session": session }))
                }
            });
        }

        let (header, footer) = tokio::join!(get_data("header"), get_data("footer"));
        let header = header.unwrap().unwrap();
        let footer = footer.unwrap().unwrap();
        assert_eq!(header["session"], footer["session"]);
    })
    .await;

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}
