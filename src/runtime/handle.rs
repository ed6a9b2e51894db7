//! Client-facing runtime handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::core::error::RuntimeError;
use crate::core::executor::TaskExecutor;
use crate::core::future::{self, TaskFuture};
use crate::core::object_store::{ObjectKey, ObjectOrigin, ObjectStore, StoreStats};
use crate::core::policy::{FifoPolicy, PlacementPolicy};
use crate::core::registry::FunctionRegistry;
use crate::core::scheduler::{Scheduler, SchedulerSnapshot, SchedulerStats};
use crate::core::task::{Arg, TaskId, TaskState};
use crate::core::worker_pool::{PoolStats, WorkerPool};

/// Aggregate statistics for one runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Identity of the runtime the numbers belong to.
    pub runtime_id: Uuid,
    /// Scheduler counters.
    pub scheduler: SchedulerStats,
    /// Object store usage.
    pub store: StoreStats,
    /// Worker pool counters.
    pub pool: PoolStats,
}

/// A running task runtime: object store, scheduler and worker pool.
///
/// Created explicitly by the caller; several runtimes can coexist in one
/// process. `stop` (or dropping the handle) shuts it down.
///
/// ```rust,ignore
/// use prometheus_dispatch::prelude::*;
/// use serde_json::json;
///
/// let mut registry = FunctionRegistry::new();
/// registry.register("square", |args| Ok(json!(args.get::<i64>(0)?.pow(2))));
///
/// let runtime = RuntimeHandle::start(RuntimeConfig::new().with_worker_count(2), registry)?;
/// let futures: Vec<_> = (1..=4)
///     .map(|n| runtime.submit("square", [Arg::value(&n)?]))
///     .collect::<Result<_, _>>()?;
/// let squares = runtime.get_many(&futures, None)?;
/// runtime.stop();
/// ```
pub struct RuntimeHandle {
    id: Uuid,
    config: RuntimeConfig,
    store: Arc<ObjectStore>,
    scheduler: Arc<Scheduler>,
    pool: WorkerPool,
    running: AtomicBool,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RuntimeHandle {
    /// Start a runtime over a function registry with FIFO placement.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::InvalidConfig` if the configuration is invalid
    /// - `RuntimeError::Internal` if worker threads could not be spawned
    pub fn start(config: RuntimeConfig, registry: FunctionRegistry) -> Result<Self, RuntimeError> {
        Self::start_with(config, Arc::new(registry), Box::new(FifoPolicy))
    }

    /// Start a runtime over any executor and placement policy.
    ///
    /// # Errors
    ///
    /// Same as [`RuntimeHandle::start`].
    pub fn start_with(
        config: RuntimeConfig,
        executor: Arc<dyn TaskExecutor>,
        policy: Box<dyn PlacementPolicy>,
    ) -> Result<Self, RuntimeError> {
        config.validate().map_err(RuntimeError::InvalidConfig)?;
        let id = Uuid::new_v4();
        let store = Arc::new(ObjectStore::new());
        let scheduler = Scheduler::new(&config, Arc::clone(&executor), policy, Arc::clone(&store));
        let pool = WorkerPool::new(config.clone(), Arc::clone(&scheduler), Arc::clone(&store), executor)?;
        if let Err(err) = pool.start(config.worker_count) {
            scheduler.shutdown();
            pool.shutdown();
            return Err(err);
        }

        info!(
            runtime_id = %id,
            worker_count = config.worker_count,
            policy = scheduler.policy_name(),
            "runtime started"
        );
        Ok(Self {
            id,
            config,
            store,
            scheduler,
            pool,
            running: AtomicBool::new(true),
        })
    }

    /// Runtime identity, as attached to logs and stats.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration the runtime was started with.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Whether `stop` has not been called yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Submit a task by callable name; returns immediately.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::submit`].
    pub fn submit<I>(&self, callable: &str, args: I) -> Result<TaskFuture, RuntimeError>
    where
        I: IntoIterator<Item = Arg>,
    {
        self.scheduler.submit(callable, args.into_iter().collect())
    }

    /// Block until the task finishes and return its value.
    ///
    /// # Errors
    ///
    /// The task's failure, see [`TaskFuture::get`].
    pub fn get(&self, future: &TaskFuture) -> Result<Arc<Value>, RuntimeError> {
        future.get(None)
    }

    /// Like [`RuntimeHandle::get`] with a wait budget.
    ///
    /// # Errors
    ///
    /// `RuntimeError::Timeout` if the budget ran out, otherwise the task's failure.
    pub fn get_timeout(&self, future: &TaskFuture, timeout: Duration) -> Result<Arc<Value>, RuntimeError> {
        future.get(Some(timeout))
    }

    /// Resolve a batch of futures in one wait; values come back in input order.
    ///
    /// # Errors
    ///
    /// See [`future::get_many`].
    pub fn get_many(&self, futures: &[TaskFuture], timeout: Option<Duration>) -> Result<Vec<Arc<Value>>, RuntimeError> {
        future::get_many(futures, timeout)
    }

    /// Async variant of [`RuntimeHandle::get_timeout`] (`None` waits indefinitely).
    ///
    /// # Errors
    ///
    /// See [`TaskFuture::get_async`].
    pub async fn get_async(&self, future: &TaskFuture, timeout: Option<Duration>) -> Result<Arc<Value>, RuntimeError> {
        future.get_async(timeout).await
    }

    /// Async variant of [`RuntimeHandle::get_many`].
    ///
    /// # Errors
    ///
    /// See [`future::get_many_async`].
    pub async fn get_many_async(
        &self,
        futures: &[TaskFuture],
        timeout: Option<Duration>,
    ) -> Result<Vec<Arc<Value>>, RuntimeError> {
        future::get_many_async(futures, timeout).await
    }

    /// Serialize a value into the object store. The caller owns the returned key
    /// until it calls [`RuntimeHandle::release`].
    ///
    /// # Errors
    ///
    /// - `RuntimeError::Serialization` if the value cannot be encoded
    /// - `RuntimeError::Shutdown` after `stop`
    pub fn put<T: Serialize + ?Sized>(&self, value: &T) -> Result<ObjectKey, RuntimeError> {
        self.put_value(serde_json::to_value(value)?)
    }

    /// Store an already-encoded value.
    ///
    /// # Errors
    ///
    /// Same as [`RuntimeHandle::put`].
    pub fn put_value(&self, value: Value) -> Result<ObjectKey, RuntimeError> {
        if !self.is_running() {
            return Err(RuntimeError::Shutdown);
        }
        self.store.put(value, ObjectOrigin::Client)
    }

    /// Read any live store entry.
    ///
    /// # Errors
    ///
    /// `RuntimeError::KeyNotFound` if the entry is absent or deleted.
    pub fn get_object(&self, key: ObjectKey) -> Result<Arc<Value>, RuntimeError> {
        self.store.get(key)
    }

    /// Give up the reference obtained from `put`.
    ///
    /// The entry is deleted now unless a submitted task still holds it, in
    /// which case it goes when the last such task finishes.
    ///
    /// # Errors
    ///
    /// `RuntimeError::KeyNotFound` if the entry is absent.
    pub fn release(&self, key: ObjectKey) -> Result<(), RuntimeError> {
        self.store.release(key)?;
        self.store.delete_if_unreferenced(key);
        Ok(())
    }

    /// Current state of a task whose record is still held.
    #[must_use]
    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.scheduler.task_state(task_id)
    }

    /// Scheduler, store and pool counters.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            runtime_id: self.id,
            scheduler: self.scheduler.stats(),
            store: self.store.stats(),
            pool: self.pool.stats(),
        }
    }

    /// Consistent copy of the scheduler's ownership tables.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.scheduler.snapshot()
    }

    /// Stop accepting work, fail queued tasks with `Shutdown`, let running
    /// tasks finish and join the workers. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let failed_queued = self.scheduler.shutdown();
        self.pool.shutdown();
        info!(runtime_id = %self.id, failed_queued, "runtime stopped");
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        // The pool's own Drop closes the inboxes without joining.
        if self.running.swap(false, Ordering::AcqRel) {
            self.scheduler.shutdown();
        }
    }
}
