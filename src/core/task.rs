//! Task identities, arguments, dispatch messages and records.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{RuntimeError, SubmissionError, TaskError};
use crate::core::future::CompletionSlot;
use crate::core::object_store::ObjectKey;

/// Task identifier, monotonic per runtime.
pub type TaskId = u64;

/// Worker identifier, unique for the lifetime of a runtime.
pub type WorkerId = usize;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for an idle worker.
    Queued,
    /// Assigned to a worker.
    Running,
    /// Finished with a stored result.
    Completed,
    /// Finished with a failure.
    Failed,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running | Self::Failed) | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

/// Argument as supplied by client code.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// A value; promoted to the object store when larger than the inlining threshold.
    Value(Value),
    /// A value already in the object store (e.g. from `put`).
    Object(ObjectKey),
}

impl Arg {
    /// Encode any serializable value as an argument.
    ///
    /// # Errors
    ///
    /// Returns `SubmissionError::MalformedArguments` if the value cannot be encoded.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self, SubmissionError> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(|e| SubmissionError::MalformedArguments(e.to_string()))
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<ObjectKey> for Arg {
    fn from(key: ObjectKey) -> Self {
        Self::Object(key)
    }
}

/// Argument as carried by a task record and its dispatch message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskArg {
    /// Small value travelling with the task.
    Inline(Value),
    /// Store entry fetched by the worker.
    Stored(ObjectKey),
}

impl TaskArg {
    /// Store key, if this argument lives in the store.
    #[must_use]
    pub const fn stored_key(&self) -> Option<ObjectKey> {
        match self {
            Self::Stored(key) => Some(*key),
            Self::Inline(_) => None,
        }
    }
}

/// Message handed to a worker when a task is assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    /// Task to run.
    pub task_id: TaskId,
    /// Registered callable name.
    pub callable: String,
    /// Ordered arguments.
    pub args: Vec<TaskArg>,
}

/// Why a task did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The callable returned an error or panicked.
    Error(TaskError),
    /// The owning worker died mid-task.
    WorkerLost(WorkerId),
    /// An argument entry disappeared before the worker fetched it.
    MissingObject(ObjectKey),
    /// The runtime stopped before the task was dispatched.
    Shutdown,
}

impl TaskFailure {
    /// Client-facing error for this failure.
    #[must_use]
    pub fn to_error(&self, task_id: TaskId) -> RuntimeError {
        match self {
            Self::Error(cause) => RuntimeError::TaskFailed {
                task_id,
                cause: cause.clone(),
            },
            Self::WorkerLost(worker_id) => RuntimeError::WorkerLost {
                task_id,
                worker_id: *worker_id,
            },
            Self::MissingObject(key) => RuntimeError::KeyNotFound(*key),
            Self::Shutdown => RuntimeError::Shutdown,
        }
    }
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Result stored under this key.
    Completed(ObjectKey),
    /// Task failed.
    Failed(TaskFailure),
}

/// Scheduler-owned record of one submission.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub callable: Arc<str>,
    pub args: Vec<TaskArg>,
    pub submitted_at_ms: u64,
    pub state: TaskState,
    pub worker: Option<WorkerId>,
    pub outcome: Option<TaskOutcome>,
    pub slot: Arc<CompletionSlot>,
    /// Cleared when the last `TaskFuture` clone is dropped.
    pub future_alive: bool,
}

impl TaskRecord {
    pub fn dispatch_message(&self) -> DispatchMessage {
        DispatchMessage {
            task_id: self.id,
            callable: self.callable.to_string(),
            args: self.args.clone(),
        }
    }

    /// Whether the record can be dropped from the task table.
    pub const fn is_retirable(&self) -> bool {
        self.state.is_terminal() && !self.future_alive
    }
}
