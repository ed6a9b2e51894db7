//! Futures returned by `submit` and the completion slots behind them.
//!
//! # Design
//!
//! - **No polling**: blocking waits use a `Condvar` per slot; `get_many`
//!   registers one countdown latch on every pending slot and waits once
//! - **Lock-free readiness**: `is_ready` reads an atomic state snapshot
//! - **Resolve once**: a slot accepts exactly one outcome; the value fetched
//!   for a completed future is cached so later `get`s never touch the store

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::error::RuntimeError;
use crate::core::object_store::{ObjectKey, ObjectStore};
use crate::core::task::{TaskId, TaskOutcome};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const FAILED: u8 = 2;

/// Deadline for a wait budget. A budget too large to represent waits indefinitely.
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Countdown latch shared by the slots of one `get_many` call.
#[derive(Debug)]
struct Latch {
    remaining: Mutex<usize>,
    condvar: Condvar,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.condvar.notify_all();
        }
    }

    /// Returns `false` if the deadline passed first.
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut remaining, deadline).timed_out() {
                        return *remaining == 0;
                    }
                }
                None => self.condvar.wait(&mut remaining),
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct SlotInner {
    outcome: Option<TaskOutcome>,
    watchers: Vec<Arc<Latch>>,
}

/// Shared between a task record and every clone of its future.
#[derive(Debug)]
pub(crate) struct CompletionSlot {
    state: AtomicU8,
    inner: Mutex<SlotInner>,
    condvar: Condvar,
}

impl CompletionSlot {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            inner: Mutex::new(SlotInner::default()),
            condvar: Condvar::new(),
        }
    }

    /// Store the outcome and wake every waiter. Returns `false` if already resolved.
    pub fn resolve(&self, outcome: TaskOutcome) -> bool {
        let watchers = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return false;
            }
            let state = match outcome {
                TaskOutcome::Completed(_) => COMPLETED,
                TaskOutcome::Failed(_) => FAILED,
            };
            inner.outcome = Some(outcome);
            self.state.store(state, Ordering::Release);
            self.condvar.notify_all();
            std::mem::take(&mut inner.watchers)
        };
        for latch in watchers {
            latch.count_down();
        }
        true
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.inner.lock().outcome.clone()
    }

    /// Wait for the outcome; `None` if the deadline passed first.
    fn wait(&self, deadline: Option<Instant>) -> Option<TaskOutcome> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(outcome) = inner.outcome.as_ref() {
                return Some(outcome.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut inner, deadline).timed_out() {
                        return inner.outcome.clone();
                    }
                }
                None => self.condvar.wait(&mut inner),
            }
        }
    }

    /// Count `latch` down on resolution. Returns `false` if already resolved.
    fn watch(&self, latch: &Arc<Latch>) -> bool {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() {
            return false;
        }
        inner.watchers.push(Arc::clone(latch));
        true
    }

    /// Drop a latch registered by a `get_many` that gave up.
    fn unwatch(&self, latch: &Arc<Latch>) {
        self.inner.lock().watchers.retain(|watcher| !Arc::ptr_eq(watcher, latch));
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }
}

/// Notified when the last clone of a future goes away.
pub(crate) trait FutureOwner: Send + Sync {
    fn future_dropped(&self, task_id: TaskId);
}

struct FutureInner {
    task_id: TaskId,
    slot: Arc<CompletionSlot>,
    store: Arc<ObjectStore>,
    cached: OnceLock<Arc<Value>>,
    owner: Weak<dyn FutureOwner>,
}

impl Drop for FutureInner {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.future_dropped(self.task_id);
        }
    }
}

/// Handle to the eventual result of a submitted task.
///
/// Cloning is cheap and every clone observes the same resolution and cached
/// value. The task record, and through it the stored result, stays alive
/// until the last clone is dropped.
#[derive(Clone)]
pub struct TaskFuture {
    inner: Arc<FutureInner>,
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("task_id", &self.inner.task_id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl TaskFuture {
    pub(crate) fn new(
        task_id: TaskId,
        slot: Arc<CompletionSlot>,
        store: Arc<ObjectStore>,
        owner: Weak<dyn FutureOwner>,
    ) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                task_id,
                slot,
                store,
                cached: OnceLock::new(),
                owner,
            }),
        }
    }

    /// Task this future denotes.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    /// Whether the task has reached a terminal state (non-blocking).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.slot.is_ready()
    }

    /// Store key of the result once the task completed successfully.
    ///
    /// The key stays valid while this future is alive and can be passed to
    /// another submission as [`crate::core::Arg::Object`].
    #[must_use]
    pub fn result_key(&self) -> Option<ObjectKey> {
        match self.inner.slot.outcome()? {
            TaskOutcome::Completed(key) => Some(key),
            TaskOutcome::Failed(_) => None,
        }
    }

    /// Block until the task finishes, then return its value.
    ///
    /// `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::Timeout` if the wait budget ran out (the task keeps running)
    /// - `RuntimeError::TaskFailed` / `WorkerLost` / `KeyNotFound` / `Shutdown` for failed tasks
    pub fn get(&self, timeout: Option<Duration>) -> Result<Arc<Value>, RuntimeError> {
        if let Some(value) = self.inner.cached.get() {
            return Ok(Arc::clone(value));
        }
        let deadline = deadline_after(timeout);
        let outcome = self.inner.slot.wait(deadline).ok_or(RuntimeError::Timeout)?;
        self.value_for(outcome)
    }

    /// Like [`TaskFuture::get`], deserializing the value into `T`.
    ///
    /// # Errors
    ///
    /// Everything `get` returns, plus `RuntimeError::Serialization` on a type mismatch.
    pub fn get_as<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T, RuntimeError> {
        let value = self.get(timeout)?;
        Ok(T::deserialize(value.as_ref())?)
    }

    /// Async variant of [`TaskFuture::get`]; the wait runs on tokio's blocking pool.
    ///
    /// # Errors
    ///
    /// Same as [`TaskFuture::get`], plus `RuntimeError::Internal` if the blocking task panicked.
    pub async fn get_async(&self, timeout: Option<Duration>) -> Result<Arc<Value>, RuntimeError> {
        if let Some(value) = self.inner.cached.get() {
            return Ok(Arc::clone(value));
        }
        let future = self.clone();
        tokio::task::spawn_blocking(move || future.get(timeout))
            .await
            .map_err(|e| RuntimeError::Internal(format!("blocking wait failed: {e}")))?
    }

    fn value_for(&self, outcome: TaskOutcome) -> Result<Arc<Value>, RuntimeError> {
        match outcome {
            TaskOutcome::Completed(key) => {
                if let Some(value) = self.inner.cached.get() {
                    return Ok(Arc::clone(value));
                }
                let fetched = self.inner.store.get(key)?;
                Ok(Arc::clone(self.inner.cached.get_or_init(|| fetched)))
            }
            TaskOutcome::Failed(failure) => Err(failure.to_error(self.inner.task_id)),
        }
    }
}

/// Resolve many futures with one blocking wait, returning values in input order.
///
/// Completion order does not matter. Once every future has resolved, the
/// first failure in input order is returned as the error.
///
/// # Errors
///
/// `RuntimeError::Timeout` if not every future resolved in time, otherwise the
/// first failure among the inputs.
pub fn get_many(futures: &[TaskFuture], timeout: Option<Duration>) -> Result<Vec<Arc<Value>>, RuntimeError> {
    let deadline = deadline_after(timeout);
    let pending: Vec<&TaskFuture> = futures
        .iter()
        .filter(|f| f.inner.cached.get().is_none() && !f.is_ready())
        .collect();

    if !pending.is_empty() {
        let latch = Arc::new(Latch::new(pending.len()));
        for future in &pending {
            if !future.inner.slot.watch(&latch) {
                latch.count_down();
            }
        }
        if !latch.wait(deadline) {
            for future in &pending {
                future.inner.slot.unwatch(&latch);
            }
            return Err(RuntimeError::Timeout);
        }
    }

    futures
        .iter()
        .map(|future| future.get(Some(Duration::ZERO)))
        .collect()
}

/// Async variant of [`get_many`].
///
/// # Errors
///
/// Same as [`get_many`], plus `RuntimeError::Internal` if the blocking task panicked.
pub async fn get_many_async(
    futures: &[TaskFuture],
    timeout: Option<Duration>,
) -> Result<Vec<Arc<Value>>, RuntimeError> {
    let futures = futures.to_vec();
    tokio::task::spawn_blocking(move || get_many(&futures, timeout))
        .await
        .map_err(|e| RuntimeError::Internal(format!("blocking wait failed: {e}")))?
}
