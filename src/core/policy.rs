//! Placement policies: which queued task goes to which idle worker.
//!
//! This is the scheduler's extension seam. The scheduler calls
//! [`PlacementPolicy::pick_worker`] under its state lock every time a task is
//! queued or a worker becomes idle, and keeps calling it until the policy
//! returns `None`. Stricter strategies (affinity, locality) can be substituted
//! without touching the rest of the scheduler.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::task::{TaskId, WorkerId};

/// View of a queued task offered to a policy.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    /// Task identifier.
    pub task_id: TaskId,
    /// Registered callable name.
    pub callable: Arc<str>,
    /// Submission time (ms since epoch).
    pub submitted_at_ms: u64,
}

/// A policy decision: position in the queue and the worker to run it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// Index into the queue passed to `pick_worker`.
    pub queue_index: usize,
    /// Must be one of the idle workers passed to `pick_worker`.
    pub worker: WorkerId,
}

/// Chooses the next (task, worker) pair.
pub trait PlacementPolicy: Send + Sync + 'static {
    /// Pick an assignment, or `None` to leave everything queued.
    ///
    /// `idle_workers` is ordered by how long each worker has been idle,
    /// longest first. Both slices are non-empty when this is called.
    fn pick_worker(&self, queue: &VecDeque<QueuedTask>, idle_workers: &[WorkerId]) -> Option<Assignment>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// First-in first-out: the oldest queued task goes to the longest-idle worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPolicy;

impl PlacementPolicy for FifoPolicy {
    fn pick_worker(&self, queue: &VecDeque<QueuedTask>, idle_workers: &[WorkerId]) -> Option<Assignment> {
        if queue.is_empty() {
            return None;
        }
        idle_workers.first().map(|&worker| Assignment {
            queue_index: 0,
            worker,
        })
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}
