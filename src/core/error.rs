//! Error types for runtime operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::object_store::ObjectKey;
use crate::core::task::{TaskId, WorkerId};

/// Errors raised synchronously by `submit`, before a task record exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    /// No callable is registered under this name.
    #[error("unknown callable: {0}")]
    UnknownCallable(String),
    /// Arguments could not be encoded or do not match the callable's arity.
    #[error("malformed arguments: {0}")]
    MalformedArguments(String),
    /// The dispatch queue reached its configured depth.
    #[error("task queue is full")]
    QueueFull,
    /// The runtime is stopped or stopping.
    #[error("runtime is not accepting submissions")]
    Shutdown,
}

/// Failure captured from a user callable, re-surfaced verbatim at `get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// Short classification (`error`, `panic`, ...).
    pub kind: String,
    /// Full description, including the error chain.
    pub message: String,
}

impl TaskError {
    /// Build an error with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an `anyhow` error returned by a callable, keeping its context chain.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::new("error", format!("{err:#}"))
    }

    /// Capture a panic payload from a callable.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "callable panicked".to_string());
        Self::new("panic", message)
    }
}

/// Errors produced by the runtime's client-facing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The submission was rejected.
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    /// The worker running the task died before reporting.
    #[error("task {task_id} lost: worker {worker_id} died")]
    WorkerLost {
        /// Task that was running.
        task_id: TaskId,
        /// Worker that stopped heartbeating.
        worker_id: WorkerId,
    },
    /// The callable returned an error or panicked.
    #[error("task {task_id} failed: {cause}")]
    TaskFailed {
        /// Failed task.
        task_id: TaskId,
        /// Captured cause.
        cause: TaskError,
    },
    /// The object was never stored or has already been deleted.
    #[error("object not found: {0}")]
    KeyNotFound(ObjectKey),
    /// The caller's wait budget ran out. The task keeps running.
    #[error("operation timed out")]
    Timeout,
    /// The runtime stopped before the task could run.
    #[error("runtime has been shut down")]
    Shutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Internal failure (blocking task join error, worker spawn failure, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
