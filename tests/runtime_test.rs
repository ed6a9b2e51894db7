//! Integration tests for the runtime
//!
//! These tests drive a real runtime (worker threads, store, scheduler) and cover:
//! - Non-blocking submission and blocking / async result retrieval
//! - Ordered `get_many` regardless of completion order
//! - Object store round trips, argument promotion and explicit release
//! - Failure propagation: callable errors, panics and lost workers
//! - Timeouts and shutdown

use prometheus_dispatch::core::{TaskError, TaskState};
use prometheus_dispatch::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register_with_arity("add", 2, |args| Ok(json!(args.get::<i64>(0)? + args.get::<i64>(1)?)))
        .register_with_arity("divide", 2, |args| {
            let (a, b) = (args.get::<i64>(0)?, args.get::<i64>(1)?);
            anyhow::ensure!(b != 0, "division by zero");
            Ok(json!(a / b))
        })
        .register_with_arity("sleep_then", 2, |args| {
            thread::sleep(Duration::from_millis(args.get(0)?));
            Ok(args.value(1)?.clone())
        })
        .register("len", |args| Ok(json!(args.get::<String>(0)?.len())))
        .register("thread_name", |_| {
            thread::sleep(Duration::from_millis(100));
            Ok(json!(thread::current().name().unwrap_or_default()))
        })
        .register("explode", |_| panic!("worker exploded"))
        .register_async("async_echo", |args| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, anyhow::Error>(args.value(0)?.clone())
        });
    registry
}

fn config(workers: usize) -> RuntimeConfig {
    RuntimeConfig::new()
        .with_worker_count(workers)
        .with_heartbeat(20, 2_000)
        .with_join_timeout_ms(1_000)
}

fn start(workers: usize) -> RuntimeHandle {
    RuntimeHandle::start(config(workers), registry()).unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ============================================================================
// SUBMISSION AND RETRIEVAL
// ============================================================================

#[test]
fn test_submit_returns_before_task_finishes() {
    let runtime = start(1);

    let started = Instant::now();
    let future = runtime
        .submit("sleep_then", [Arg::Value(json!(300)), Arg::Value(json!("done"))])
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(!future.is_ready());

    assert_eq!(*runtime.get(&future).unwrap(), json!("done"));
    assert!(future.is_ready());
    runtime.stop();
}

#[test]
fn test_get_many_preserves_input_order_under_reversed_completion() {
    let runtime = start(3);

    let futures: Vec<TaskFuture> = [(300, "a"), (150, "b"), (10, "c")]
        .iter()
        .map(|(ms, tag)| runtime.submit("sleep_then", [Arg::Value(json!(ms)), Arg::Value(json!(tag))]))
        .collect::<Result<_, _>>()
        .unwrap();

    let values = runtime.get_many(&futures, Some(Duration::from_secs(5))).unwrap();
    let values: Vec<_> = values.iter().map(|v| v.as_ref().clone()).collect();
    assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    runtime.stop();
}

#[test]
fn test_repeated_get_uses_cached_value() {
    let runtime = start(1);
    let future = runtime.submit("add", [Arg::Value(json!(2)), Arg::Value(json!(3))]).unwrap();

    let first = runtime.get(&future).unwrap();
    let gets_after_first = runtime.stats().store.gets;
    let second = runtime.get(&future).unwrap();
    let third = future.clone().get(None).unwrap();

    assert_eq!(*first, json!(5));
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(runtime.stats().store.gets, gets_after_first);
    runtime.stop();
}

#[test]
fn test_typed_get() {
    let runtime = start(1);
    let future = runtime.submit("add", [Arg::value(&40).unwrap(), Arg::value(&2).unwrap()]).unwrap();
    assert_eq!(future.get_as::<i64>(None).unwrap(), 42);
    assert!(matches!(future.get_as::<String>(None), Err(RuntimeError::Serialization(_))));
    runtime.stop();
}

#[test]
fn test_k_tasks_on_k_workers_run_on_distinct_workers() {
    let workers = 4;
    let runtime = start(workers);

    let futures: Vec<TaskFuture> = (0..workers)
        .map(|_| runtime.submit("thread_name", []))
        .collect::<Result<_, _>>()
        .unwrap();

    assert!(wait_until(|| runtime.snapshot().running.len() == workers));
    let snapshot = runtime.snapshot();
    snapshot.verify().unwrap();
    assert!(snapshot.idle_workers.is_empty());
    assert!(snapshot.queued.is_empty());

    let names: HashSet<String> = runtime
        .get_many(&futures, Some(Duration::from_secs(5)))
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names.len(), workers);
    assert!(names.iter().all(|name| name.starts_with("dispatch-worker-")));

    runtime.snapshot().verify().unwrap();
    runtime.stop();
}

// ============================================================================
// OBJECT STORE
// ============================================================================

#[test]
fn test_put_get_round_trip_small_and_large() {
    let runtime = start(1);

    let small = runtime.put(&json!({"label": "cat", "score": 0.93})).unwrap();
    assert_eq!(*runtime.get_object(small).unwrap(), json!({"label": "cat", "score": 0.93}));

    let text = "x".repeat(200_000);
    let large = runtime.put(&text).unwrap();
    assert_eq!(runtime.get_object(large).unwrap().as_str(), Some(text.as_str()));

    let future = runtime.submit("len", [Arg::Object(large)]).unwrap();
    assert_eq!(*runtime.get(&future).unwrap(), json!(200_000));
    assert!(runtime.get_object(large).is_ok());
    runtime.stop();
}

#[test]
fn test_large_argument_is_moved_to_store() {
    let runtime = RuntimeHandle::start(config(1).with_inline_threshold_bytes(1_024), registry()).unwrap();

    let future = runtime.submit("len", [Arg::value(&"y".repeat(5_000)).unwrap()]).unwrap();
    assert_eq!(*runtime.get(&future).unwrap(), json!(5_000));

    // One put for the promoted argument, one for the result.
    assert_eq!(runtime.stats().store.puts, 2);
    drop(future);
    assert_eq!(runtime.stats().store.entries, 0);
    runtime.stop();
}

#[test]
fn test_released_key_is_not_found() {
    let runtime = start(1);
    let key = runtime.put(&vec![1, 2, 3]).unwrap();
    runtime.release(key).unwrap();

    assert_eq!(runtime.get_object(key).unwrap_err(), RuntimeError::KeyNotFound(key));
    assert_eq!(runtime.submit("len", [Arg::Object(key)]).unwrap_err(), RuntimeError::KeyNotFound(key));
    assert_eq!(runtime.release(key).unwrap_err(), RuntimeError::KeyNotFound(key));
    runtime.stop();
}

#[test]
fn test_result_key_feeds_another_task() {
    let runtime = start(2);
    let first = runtime.submit("add", [Arg::Value(json!(1)), Arg::Value(json!(5))]).unwrap();
    runtime.get(&first).unwrap();

    let key = first.result_key().unwrap();
    let second = runtime.submit("add", [Arg::Object(key), Arg::Value(json!(4))]).unwrap();
    assert_eq!(*runtime.get(&second).unwrap(), json!(10));
    runtime.stop();
}

// ============================================================================
// FAILURES
// ============================================================================

#[test]
fn test_callable_error_reaches_caller() {
    let runtime = start(1);
    let future = runtime.submit("divide", [Arg::Value(json!(1)), Arg::Value(json!(0))]).unwrap();

    let err = runtime.get(&future).unwrap_err();
    match &err {
        RuntimeError::TaskFailed { task_id, cause } => {
            assert_eq!(*task_id, future.task_id());
            assert_eq!(cause.message, "division by zero");
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    assert!(err.to_string().contains("division by zero"));

    // A failed task does not stop the runtime.
    let ok = runtime.submit("divide", [Arg::Value(json!(9)), Arg::Value(json!(3))]).unwrap();
    assert_eq!(*runtime.get(&ok).unwrap(), json!(3));
    runtime.stop();
}

#[test]
fn test_get_many_reports_first_failure_in_input_order() {
    let runtime = start(3);
    let futures = vec![
        runtime.submit("sleep_then", [Arg::Value(json!(50)), Arg::Value(json!(1))]).unwrap(),
        runtime.submit("divide", [Arg::Value(json!(1)), Arg::Value(json!(0))]).unwrap(),
        runtime.submit("explode", []).unwrap(),
    ];

    let err = runtime.get_many(&futures, Some(Duration::from_secs(5))).unwrap_err();
    assert!(
        matches!(err, RuntimeError::TaskFailed { task_id, .. } if task_id == futures[1].task_id()),
        "{err:?}"
    );
    assert!(futures.iter().all(TaskFuture::is_ready));
    runtime.stop();
}

#[test]
fn test_panic_is_reported_as_task_failure() {
    let runtime = start(1);
    let future = runtime.submit("explode", []).unwrap();

    let err = runtime.get(&future).unwrap_err();
    assert_eq!(
        err,
        RuntimeError::TaskFailed {
            task_id: future.task_id(),
            cause: TaskError::new("panic", "worker exploded"),
        }
    );
    assert_eq!(runtime.stats().pool.panics_caught, 1);
    runtime.stop();
}

#[test]
fn test_uncaught_panic_loses_worker() {
    let runtime = RuntimeHandle::start(
        config(1).with_catch_panics(false).with_respawn_lost_workers(false),
        registry(),
    )
    .unwrap();
    let future = runtime.submit("explode", []).unwrap();

    let err = runtime.get_timeout(&future, Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, RuntimeError::WorkerLost { task_id, .. } if task_id == future.task_id()), "{err:?}");

    let stats = runtime.stats();
    assert_eq!(stats.scheduler.workers_lost, 1);
    assert_eq!(stats.pool.workers_respawned, 0);
    runtime.stop();
}

#[test]
fn test_timeout_leaves_task_running() {
    let runtime = start(1);
    let future = runtime
        .submit("sleep_then", [Arg::Value(json!(300)), Arg::Value(json!("late"))])
        .unwrap();

    assert_eq!(
        runtime.get_timeout(&future, Duration::from_millis(20)).unwrap_err(),
        RuntimeError::Timeout
    );
    assert_eq!(runtime.task_state(future.task_id()), Some(TaskState::Running));
    assert_eq!(*runtime.get(&future).unwrap(), json!("late"));
    runtime.stop();
}

#[test]
fn test_huge_timeout_waits_for_result() {
    let runtime = start(1);
    let single = runtime
        .submit("sleep_then", [Arg::Value(json!(30)), Arg::Value(json!("one"))])
        .unwrap();
    assert_eq!(*runtime.get_timeout(&single, Duration::MAX).unwrap(), json!("one"));

    let futures: Vec<TaskFuture> = (0..2)
        .map(|i| runtime.submit("sleep_then", [Arg::Value(json!(30)), Arg::Value(json!(i))]))
        .collect::<Result<_, _>>()
        .unwrap();
    let values = runtime.get_many(&futures, Some(Duration::MAX)).unwrap();
    assert_eq!(*values[0], json!(0));
    assert_eq!(*values[1], json!(1));
    runtime.stop();
}

#[test]
fn test_submission_validation() {
    let runtime = start(1);
    assert_eq!(
        runtime.submit("nope", []).unwrap_err(),
        RuntimeError::Submission(SubmissionError::UnknownCallable("nope".into()))
    );
    assert!(matches!(
        runtime.submit("add", [Arg::Value(json!(1))]),
        Err(RuntimeError::Submission(SubmissionError::MalformedArguments(_)))
    ));
    assert_eq!(runtime.stats().scheduler.submitted, 0);
    runtime.stop();
}

#[test]
fn test_invalid_config_is_rejected() {
    let err = RuntimeHandle::start(config(0), registry()).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidConfig(_)));
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[test]
fn test_stop_fails_queued_tasks_and_rejects_new_work() {
    let runtime = start(1);
    let running = runtime
        .submit("sleep_then", [Arg::Value(json!(200)), Arg::Value(json!("finished"))])
        .unwrap();
    let queued: Vec<TaskFuture> = (0..2)
        .map(|i| runtime.submit("add", [Arg::Value(json!(i)), Arg::Value(json!(i))]))
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(wait_until(|| runtime.task_state(running.task_id()) == Some(TaskState::Running)));

    runtime.stop();
    assert!(!runtime.is_running());

    assert_eq!(*running.get(Some(Duration::ZERO)).unwrap(), json!("finished"));
    for future in &queued {
        assert_eq!(future.get(Some(Duration::ZERO)).unwrap_err(), RuntimeError::Shutdown);
    }
    assert_eq!(
        runtime.submit("add", [Arg::Value(json!(1)), Arg::Value(json!(1))]).unwrap_err(),
        RuntimeError::Submission(SubmissionError::Shutdown)
    );
    assert_eq!(runtime.put(&1).unwrap_err(), RuntimeError::Shutdown);

    // Idempotent.
    runtime.stop();
}

#[test]
fn test_stats_carry_runtime_identity() {
    let runtime = start(2);
    let futures: Vec<TaskFuture> = (0..5)
        .map(|i| runtime.submit("add", [Arg::Value(json!(i)), Arg::Value(json!(1))]))
        .collect::<Result<_, _>>()
        .unwrap();
    runtime.get_many(&futures, None).unwrap();

    let stats = runtime.stats();
    assert_eq!(stats.runtime_id, runtime.id());
    assert_eq!(stats.scheduler.submitted, 5);
    assert_eq!(stats.scheduler.completed, 5);
    assert_eq!(stats.pool.target_workers, 2);

    let encoded = serde_json::to_value(&stats).unwrap();
    assert_eq!(encoded["runtime_id"], json!(runtime.id().to_string()));
    assert_eq!(encoded["scheduler"]["completed"], json!(5));
    assert_eq!(encoded["store"]["puts"], json!(stats.store.puts));
    runtime.stop();
}

// ============================================================================
// ASYNC API
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_get_and_get_many() {
    let runtime = start(2);

    let single = runtime.submit("async_echo", [Arg::Value(json!("hi"))]).unwrap();
    assert_eq!(*runtime.get_async(&single, Some(Duration::from_secs(5))).await.unwrap(), json!("hi"));

    let futures: Vec<TaskFuture> = (0..4)
        .map(|i| runtime.submit("async_echo", [Arg::Value(json!(i))]))
        .collect::<Result<_, _>>()
        .unwrap();
    let values = runtime.get_many_async(&futures, None).await.unwrap();
    assert_eq!(values.iter().map(|v| v.as_i64().unwrap()).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    let joined = futures::future::join_all(futures.iter().map(|f| f.get_async(None))).await;
    assert!(joined.iter().all(Result::is_ok));
    runtime.stop();
}
