//! Task scheduler: task table, FIFO queue, idle-worker set and dispatch.
//!
//! # Design
//!
//! - **One lock**: task records, the queue and the worker sets live behind a
//!   single `parking_lot::Mutex`, so dispatch and completion always observe a
//!   consistent picture and no task is ever handed to two workers
//! - **Non-blocking submit**: argument promotion happens before the lock is
//!   taken; the critical section inserts the record and dispatches
//! - **Futures outside the lock**: dropping the last `TaskFuture` calls back
//!   into the scheduler, so futures are only created with the lock released

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::core::error::{RuntimeError, SubmissionError};
use crate::core::executor::TaskExecutor;
use crate::core::future::{CompletionSlot, FutureOwner, TaskFuture};
use crate::core::object_store::{encoded_len, ObjectKey, ObjectOrigin, ObjectStore};
use crate::core::policy::{PlacementPolicy, QueuedTask};
use crate::core::task::{
    Arg, DispatchMessage, TaskArg, TaskFailure, TaskId, TaskOutcome, TaskRecord, TaskState, WorkerId,
};
use crate::core::worker_pool::Heartbeat;
use crate::util::now_ms;

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Total accepted submissions.
    pub submitted: u64,
    /// Tasks waiting for a worker.
    pub queued: u64,
    /// Tasks currently assigned to a worker.
    pub running: u64,
    /// Tasks finished with a result.
    pub completed: u64,
    /// Tasks finished with a failure.
    pub failed: u64,
    /// Workers removed after dying or going silent.
    pub workers_lost: u64,
    /// Records still held in the task table.
    pub live_records: u64,
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    submitted: AtomicU64,
    queued: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    workers_lost: AtomicU64,
    live_records: AtomicU64,
}

impl SchedulerCounters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            workers_lost: self.workers_lost.load(Ordering::Relaxed),
            live_records: self.live_records.load(Ordering::Relaxed),
        }
    }
}

/// Consistent copy of the scheduler's ownership tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// Queued task ids in queue order.
    pub queued: Vec<TaskId>,
    /// `(task, worker)` for every running task record.
    pub running: Vec<(TaskId, WorkerId)>,
    /// `(worker, task)` for every worker holding a task.
    pub busy_workers: Vec<(WorkerId, TaskId)>,
    /// Idle workers, longest idle first.
    pub idle_workers: Vec<WorkerId>,
    /// Records in the task table.
    pub records: usize,
}

impl SchedulerSnapshot {
    /// Check the ownership invariants.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation found.
    pub fn verify(&self) -> Result<(), String> {
        let mut owners: HashMap<TaskId, WorkerId> = HashMap::new();
        for &(worker, task) in &self.busy_workers {
            if let Some(other) = owners.insert(task, worker) {
                return Err(format!("task {task} held by workers {other} and {worker}"));
            }
        }
        for &(task, worker) in &self.running {
            match owners.get(&task) {
                Some(&holder) if holder == worker => {}
                Some(&holder) => {
                    return Err(format!("task {task} recorded on worker {worker} but held by {holder}"));
                }
                None => return Err(format!("running task {task} has no owning worker")),
            }
        }
        if owners.len() != self.running.len() {
            return Err("a worker holds a task that is not running".into());
        }

        let busy: HashSet<WorkerId> = self.busy_workers.iter().map(|&(worker, _)| worker).collect();
        let mut seen = HashSet::new();
        for &worker in &self.idle_workers {
            if busy.contains(&worker) {
                return Err(format!("worker {worker} is both idle and busy"));
            }
            if !seen.insert(worker) {
                return Err(format!("worker {worker} is listed idle twice"));
            }
        }
        if let Some(task) = self.queued.iter().find(|task| owners.contains_key(*task)) {
            return Err(format!("task {task} is both queued and running"));
        }
        Ok(())
    }
}

struct WorkerSlot {
    /// `None` once the worker has been told to finish up.
    tx: Option<Sender<DispatchMessage>>,
    heartbeat: Arc<Heartbeat>,
    current: Option<TaskId>,
}

struct SchedulerState {
    records: HashMap<TaskId, TaskRecord>,
    queue: VecDeque<QueuedTask>,
    idle: VecDeque<WorkerId>,
    workers: HashMap<WorkerId, WorkerSlot>,
    accepting: bool,
    /// Workers removed since the last liveness sweep.
    lost: Vec<WorkerId>,
}

/// Owns every task record and decides which worker runs what.
pub struct Scheduler {
    executor: Arc<dyn TaskExecutor>,
    policy: Box<dyn PlacementPolicy>,
    store: Arc<ObjectStore>,
    inline_threshold_bytes: usize,
    max_queue_depth: usize,
    state: Mutex<SchedulerState>,
    next_task_id: AtomicU64,
    counters: SchedulerCounters,
    self_ref: Weak<Self>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("policy", &self.policy.name())
            .field("inline_threshold_bytes", &self.inline_threshold_bytes)
            .field("max_queue_depth", &self.max_queue_depth)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler with no workers attached.
    pub fn new(
        config: &RuntimeConfig,
        executor: Arc<dyn TaskExecutor>,
        policy: Box<dyn PlacementPolicy>,
        store: Arc<ObjectStore>,
    ) -> Arc<Self> {
        info!(
            policy = policy.name(),
            inline_threshold_bytes = config.inline_threshold_bytes,
            max_queue_depth = config.max_queue_depth,
            "scheduler created"
        );
        Arc::new_cyclic(|self_ref| Self {
            executor,
            policy,
            store,
            inline_threshold_bytes: config.inline_threshold_bytes,
            max_queue_depth: config.max_queue_depth,
            state: Mutex::new(SchedulerState {
                records: HashMap::new(),
                queue: VecDeque::new(),
                idle: VecDeque::new(),
                workers: HashMap::new(),
                accepting: true,
                lost: Vec::new(),
            }),
            next_task_id: AtomicU64::new(1),
            counters: SchedulerCounters::default(),
            self_ref: self_ref.clone(),
        })
    }

    /// Accept a task and return its future without waiting for execution.
    ///
    /// Values whose encoded size exceeds the inlining threshold are moved into
    /// the object store; object arguments are pinned until the task finishes.
    ///
    /// # Errors
    ///
    /// - `SubmissionError::UnknownCallable` / `MalformedArguments` from validation
    /// - `SubmissionError::QueueFull` when the queue is at capacity
    /// - `SubmissionError::Shutdown` after [`Scheduler::shutdown`]
    /// - `RuntimeError::KeyNotFound` for an object argument that no longer exists
    pub fn submit(&self, callable: &str, args: Vec<Arg>) -> Result<TaskFuture, RuntimeError> {
        self.executor.validate(callable, args.len())?;
        if !self.state.lock().accepting {
            return Err(SubmissionError::Shutdown.into());
        }

        let args = self.prepare_args(args)?;
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(CompletionSlot::new());
        let callable: Arc<str> = Arc::from(callable);
        let submitted_at_ms = now_ms();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let rejection = if !state.accepting {
                Some(SubmissionError::Shutdown)
            } else if state.queue.len() >= self.max_queue_depth {
                Some(SubmissionError::QueueFull)
            } else {
                None
            };
            if let Some(rejection) = rejection {
                drop(guard);
                self.release_args(&args);
                warn!(callable = %callable, error = %rejection, "submission rejected");
                return Err(rejection.into());
            }

            state.records.insert(
                task_id,
                TaskRecord {
                    id: task_id,
                    callable: Arc::clone(&callable),
                    args,
                    submitted_at_ms,
                    state: TaskState::Queued,
                    worker: None,
                    outcome: None,
                    slot: Arc::clone(&slot),
                    future_alive: true,
                },
            );
            state.queue.push_back(QueuedTask {
                task_id,
                callable: Arc::clone(&callable),
                submitted_at_ms,
            });
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            self.counters.live_records.fetch_add(1, Ordering::Relaxed);
            self.dispatch_locked(state);
        }

        debug!(task_id, callable = %callable, "task submitted");
        let owner: Weak<dyn FutureOwner> = self.self_ref.clone();
        Ok(TaskFuture::new(task_id, slot, Arc::clone(&self.store), owner))
    }

    /// Record a worker's result for the task it was running, then hand it more work.
    ///
    /// Reports for tasks the worker no longer owns (it was declared lost in
    /// the meantime) are discarded and their result entry is dropped.
    pub fn report(&self, worker_id: WorkerId, task_id: TaskId, outcome: TaskOutcome) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let owned = state
            .records
            .get(&task_id)
            .is_some_and(|record| record.state == TaskState::Running && record.worker == Some(worker_id));
        if owned {
            self.finish_locked(state, task_id, outcome);
        } else {
            warn!(worker_id, task_id, "discarding report for a task this worker no longer owns");
            if let TaskOutcome::Completed(key) = outcome {
                self.drop_entry(key);
            }
        }

        if let Some(slot) = state.workers.get_mut(&worker_id) {
            if slot.current == Some(task_id) {
                slot.current = None;
            }
            if slot.current.is_none() && slot.tx.is_some() && !state.idle.contains(&worker_id) {
                state.idle.push_back(worker_id);
            }
        }
        self.dispatch_locked(state);
    }

    /// Attach a worker; it becomes idle immediately.
    pub(crate) fn register_worker(&self, worker_id: WorkerId, tx: Sender<DispatchMessage>, heartbeat: Arc<Heartbeat>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.accepting {
            debug!(worker_id, "scheduler stopped, worker not registered");
            return;
        }
        state.workers.insert(
            worker_id,
            WorkerSlot {
                tx: Some(tx),
                heartbeat,
                current: None,
            },
        );
        state.idle.push_back(worker_id);
        debug!(worker_id, "worker registered");
        self.dispatch_locked(state);
    }

    /// Remove workers whose thread exited, or that are idle with a heartbeat
    /// older than `timeout_ms`. A removed worker's running task fails with
    /// `WorkerLost` and is not resubmitted.
    ///
    /// Returns every worker removed since the previous sweep.
    pub(crate) fn sweep_liveness(&self, now: u64, timeout_ms: u64) -> Vec<WorkerId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let dead: Vec<WorkerId> = state
            .workers
            .iter()
            .filter(|(_, slot)| slot.tx.is_some() || slot.current.is_some())
            .filter(|(_, slot)| {
                slot.heartbeat.has_exited()
                    || (slot.current.is_none()
                        && now.saturating_sub(slot.heartbeat.last_beat_ms()) > timeout_ms)
            })
            .map(|(&worker_id, _)| worker_id)
            .collect();
        for worker_id in dead {
            self.remove_worker_locked(state, worker_id);
        }
        std::mem::take(&mut state.lost)
    }

    /// Stop accepting submissions and fail every task still queued.
    ///
    /// Running tasks are left to finish. Returns how many queued tasks failed.
    pub fn shutdown(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.accepting {
            return 0;
        }
        state.accepting = false;
        let drained: Vec<TaskId> = state.queue.drain(..).map(|queued| queued.task_id).collect();
        for &task_id in &drained {
            self.finish_locked(state, task_id, TaskOutcome::Failed(TaskFailure::Shutdown));
        }
        info!(failed_queued = drained.len(), "scheduler stopped accepting tasks");
        drained.len()
    }

    /// Close every worker's channel so each exits after its current task.
    pub(crate) fn disconnect_workers(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for slot in state.workers.values_mut() {
            slot.tx = None;
        }
        state.idle.clear();
    }

    /// Whether submissions are accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    /// Current state of a task, if its record is still held.
    #[must_use]
    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.state.lock().records.get(&task_id).map(|record| record.state)
    }

    /// Workers currently able to receive tasks.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.state.lock().workers.values().filter(|slot| slot.tx.is_some()).count()
    }

    /// Name of the placement policy in use.
    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Counter snapshot (lock-free).
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    /// Copy of the ownership tables, taken under the state lock.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock();
        let mut running: Vec<(TaskId, WorkerId)> = state
            .records
            .values()
            .filter(|record| record.state == TaskState::Running)
            .filter_map(|record| record.worker.map(|worker| (record.id, worker)))
            .collect();
        running.sort_unstable();
        let mut busy_workers: Vec<(WorkerId, TaskId)> = state
            .workers
            .iter()
            .filter_map(|(&worker, slot)| slot.current.map(|task| (worker, task)))
            .collect();
        busy_workers.sort_unstable();
        SchedulerSnapshot {
            queued: state.queue.iter().map(|queued| queued.task_id).collect(),
            running,
            busy_workers,
            idle_workers: state.idle.iter().copied().collect(),
            records: state.records.len(),
        }
    }

    fn prepare_args(&self, args: Vec<Arg>) -> Result<Vec<TaskArg>, RuntimeError> {
        let mut prepared = Vec::with_capacity(args.len());
        for arg in args {
            match self.prepare_arg(arg) {
                Ok(arg) => prepared.push(arg),
                Err(err) => {
                    self.release_args(&prepared);
                    return Err(err);
                }
            }
        }
        Ok(prepared)
    }

    fn prepare_arg(&self, arg: Arg) -> Result<TaskArg, RuntimeError> {
        match arg {
            Arg::Value(value) => {
                let size = encoded_len(&value).map_err(|e| SubmissionError::MalformedArguments(e.to_string()))?;
                if size <= self.inline_threshold_bytes {
                    return Ok(TaskArg::Inline(value));
                }
                // The reference taken by the put belongs to the task record.
                let key = self.store.put_sized(value, size, ObjectOrigin::Client);
                self.store.pin(key)?;
                trace!(%key, size, "argument promoted to object store");
                Ok(TaskArg::Stored(key))
            }
            Arg::Object(key) => {
                self.store.retain(key)?;
                self.store.pin(key)?;
                Ok(TaskArg::Stored(key))
            }
        }
    }

    fn release_args(&self, args: &[TaskArg]) {
        for key in args.iter().filter_map(TaskArg::stored_key) {
            if let Err(err) = self.store.unpin(key).and_then(|()| self.store.release(key)) {
                warn!(%key, error = %err, "argument entry vanished before release");
            }
            self.store.delete_if_unreferenced(key);
        }
    }

    fn drop_entry(&self, key: ObjectKey) {
        if let Err(err) = self.store.release(key) {
            debug!(%key, error = %err, "result entry already gone");
        }
        self.store.delete_if_unreferenced(key);
    }

    /// Hand queued tasks to idle workers until the policy declines.
    fn dispatch_locked(&self, state: &mut SchedulerState) {
        while !state.queue.is_empty() && !state.idle.is_empty() {
            let idle = state.idle.make_contiguous();
            let Some(assignment) = self.policy.pick_worker(&state.queue, idle) else {
                break;
            };
            let worker_id = assignment.worker;
            let Some(idle_pos) = state.idle.iter().position(|&worker| worker == worker_id) else {
                error!(policy = self.policy.name(), worker_id, "policy picked a worker that is not idle");
                break;
            };
            let Some(task_id) = state.queue.get(assignment.queue_index).map(|queued| queued.task_id) else {
                error!(
                    policy = self.policy.name(),
                    queue_index = assignment.queue_index,
                    "policy picked a queue position out of range"
                );
                break;
            };
            let Some(message) = state.records.get(&task_id).map(TaskRecord::dispatch_message) else {
                error!(task_id, "queued task has no record");
                state.queue.remove(assignment.queue_index);
                continue;
            };

            let sent = match state.workers.get(&worker_id).and_then(|slot| slot.tx.as_ref()) {
                Some(tx) => tx.try_send(message).map_err(|e| e.to_string()),
                None => Err("worker is not accepting tasks".to_string()),
            };
            if let Err(reason) = sent {
                warn!(worker_id, reason = %reason, "dispatch failed, removing worker");
                self.remove_worker_locked(state, worker_id);
                continue;
            }

            state.queue.remove(assignment.queue_index);
            state.idle.remove(idle_pos);
            if let Some(slot) = state.workers.get_mut(&worker_id) {
                slot.current = Some(task_id);
            }
            if let Some(record) = state.records.get_mut(&task_id) {
                record.state = TaskState::Running;
                record.worker = Some(worker_id);
                debug!(
                    task_id,
                    worker_id,
                    waited_ms = now_ms().saturating_sub(record.submitted_at_ms),
                    "task dispatched"
                );
            }
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            self.counters.running.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Move a task to its terminal state, resolve its future and release its arguments.
    fn finish_locked(&self, state: &mut SchedulerState, task_id: TaskId, outcome: TaskOutcome) {
        let Some(record) = state.records.get_mut(&task_id) else {
            return;
        };
        let next = match outcome {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
        };
        if !record.state.can_transition_to(next) {
            error!(task_id, from = ?record.state, to = ?next, "illegal task transition ignored");
            if let TaskOutcome::Completed(key) = outcome {
                self.drop_entry(key);
            }
            return;
        }

        match record.state {
            TaskState::Queued => self.counters.queued.fetch_sub(1, Ordering::Relaxed),
            _ => self.counters.running.fetch_sub(1, Ordering::Relaxed),
        };
        match &outcome {
            TaskOutcome::Completed(key) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(task_id, result = %key, "task completed");
            }
            TaskOutcome::Failed(failure) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(task_id, ?failure, "task failed");
            }
        }

        record.state = next;
        record.outcome = Some(outcome.clone());
        record.slot.resolve(outcome);
        let args = std::mem::take(&mut record.args);
        let retirable = record.is_retirable();
        self.release_args(&args);
        if retirable {
            self.retire_locked(state, task_id);
        }
    }

    /// Drop a terminal record nobody can observe any more, with its result entry.
    fn retire_locked(&self, state: &mut SchedulerState, task_id: TaskId) {
        let Some(record) = state.records.remove(&task_id) else {
            return;
        };
        self.counters.live_records.fetch_sub(1, Ordering::Relaxed);
        if let Some(TaskOutcome::Completed(key)) = record.outcome {
            self.drop_entry(key);
        }
        trace!(task_id, "task record retired");
    }

    fn remove_worker_locked(&self, state: &mut SchedulerState, worker_id: WorkerId) {
        let Some(slot) = state.workers.remove(&worker_id) else {
            return;
        };
        state.idle.retain(|&worker| worker != worker_id);
        state.lost.push(worker_id);
        self.counters.workers_lost.fetch_add(1, Ordering::Relaxed);
        match slot.current {
            Some(task_id) => {
                warn!(worker_id, task_id, "worker lost while running a task");
                self.finish_locked(state, task_id, TaskOutcome::Failed(TaskFailure::WorkerLost(worker_id)));
            }
            None => warn!(worker_id, "idle worker lost"),
        }
    }
}

impl FutureOwner for Scheduler {
    fn future_dropped(&self, task_id: TaskId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let retirable = state.records.get_mut(&task_id).is_some_and(|record| {
            record.future_alive = false;
            record.is_retirable()
        });
        if retirable {
            self.retire_locked(state, task_id);
        }
    }
}
