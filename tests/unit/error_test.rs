//! Tests for error types

use prometheus_dispatch::core::{ObjectKey, ObjectOrigin, RuntimeError, SubmissionError, TaskError};

#[test]
fn test_queue_full_error() {
    let err = RuntimeError::from(SubmissionError::QueueFull);
    assert_eq!(format!("{err}"), "task queue is full");
}

#[test]
fn test_unknown_callable_error() {
    let err = SubmissionError::UnknownCallable("fib".to_string());
    assert_eq!(format!("{err}"), "unknown callable: fib");
}

#[test]
fn test_task_failed_error() {
    let err = RuntimeError::TaskFailed {
        task_id: 7,
        cause: TaskError::new("error", "division by zero"),
    };
    assert_eq!(format!("{err}"), "task 7 failed: error: division by zero");
}

#[test]
fn test_worker_lost_error() {
    let err = RuntimeError::WorkerLost { task_id: 3, worker_id: 1 };
    assert_eq!(format!("{err}"), "task 3 lost: worker 1 died");
}

#[test]
fn test_key_not_found_error() {
    let key = ObjectKey {
        origin: ObjectOrigin::Worker(2),
        seq: 9,
    };
    assert_eq!(format!("{}", RuntimeError::KeyNotFound(key)), "object not found: obj-w2-9");
}

#[test]
fn test_task_error_serializes() {
    let cause = TaskError::new("panic", "boom");
    let encoded = serde_json::to_value(&cause).unwrap();
    assert_eq!(encoded, serde_json::json!({"kind": "panic", "message": "boom"}));
}
