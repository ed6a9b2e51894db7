//! Worker pool: dedicated OS threads that execute dispatched tasks.
//!
//! Each worker owns a single-threaded tokio runtime, a one-slot inbox fed by
//! the scheduler and a local replica of the object store. A monitor thread
//! sweeps heartbeats once per interval; workers it finds dead have their
//! running task failed by the scheduler and, if configured, are replaced.
//!
//! # Design
//!
//! - **No polling**: workers block on their inbox, using the heartbeat
//!   interval as the receive timeout
//! - **Clean shutdown**: dropping a worker's sender unblocks it once its
//!   current task is done
//! - **Bounded joins**: `shutdown` gives every worker a fixed join budget and
//!   detaches stragglers instead of hanging

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::core::error::RuntimeError;
use crate::core::executor::TaskExecutor;
use crate::core::object_store::ObjectStore;
use crate::core::scheduler::Scheduler;
use crate::core::task::WorkerId;
use crate::util::now_ms;

pub(crate) use worker::Heartbeat;
use worker::{spawn_worker, WorkerContext};

/// Statistics about pool threads and the work they ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Workers requested through `start`.
    pub target_workers: usize,
    /// Worker threads currently tracked by the pool.
    pub live_workers: usize,
    /// Tasks executed (successful or not).
    pub tasks_executed: u64,
    /// Executed tasks that ended in failure.
    pub tasks_failed: u64,
    /// Callable panics converted into task failures.
    pub panics_caught: u64,
    /// Workers declared lost by the monitor.
    pub workers_lost: u64,
    /// Replacement workers started.
    pub workers_respawned: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub tasks_executed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub panics_caught: AtomicU64,
    pub workers_lost: AtomicU64,
    pub workers_respawned: AtomicU64,
}

impl PoolCounters {
    pub fn snapshot(&self, target_workers: usize, live_workers: usize) -> PoolStats {
        PoolStats {
            target_workers,
            live_workers,
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            panics_caught: self.panics_caught.load(Ordering::Relaxed),
            workers_lost: self.workers_lost.load(Ordering::Relaxed),
            workers_respawned: self.workers_respawned.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the pool handle and its monitor thread.
struct PoolShared {
    config: RuntimeConfig,
    scheduler: Arc<Scheduler>,
    store: Arc<ObjectStore>,
    executor: Arc<dyn TaskExecutor>,
    handles: Mutex<HashMap<WorkerId, JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
    target_workers: AtomicUsize,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
}

impl PoolShared {
    /// Start one worker thread and attach it to the scheduler.
    fn spawn_one(&self) -> Result<WorkerId, RuntimeError> {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (tx, inbox) = bounded(1);
        let heartbeat = Arc::new(Heartbeat::new());
        let ctx = WorkerContext {
            worker_id,
            inbox,
            heartbeat: Arc::clone(&heartbeat),
            scheduler: Arc::clone(&self.scheduler),
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            counters: Arc::clone(&self.counters),
            heartbeat_interval: self.config.heartbeat_interval(),
            catch_panics: self.config.catch_panics,
        };
        let handle = spawn_worker(ctx, self.config.thread_stack_size)
            .map_err(|e| RuntimeError::Internal(format!("failed to spawn worker {worker_id}: {e}")))?;
        self.handles.lock().insert(worker_id, handle);
        self.scheduler.register_worker(worker_id, tx, heartbeat);
        Ok(worker_id)
    }

    /// Collect threads of lost workers and start replacements.
    fn reap(&self, lost: &[WorkerId]) {
        for &worker_id in lost {
            self.counters.workers_lost.fetch_add(1, Ordering::Relaxed);
            let handle = self.handles.lock().remove(&worker_id);
            match handle {
                Some(handle) if handle.is_finished() => {
                    if handle.join().is_err() {
                        warn!(worker_id, "lost worker panicked");
                    }
                }
                Some(_) => warn!(worker_id, "lost worker thread still running - detaching"),
                None => {}
            }

            if self.config.respawn_lost_workers && !self.shutdown.load(Ordering::Acquire) {
                match self.spawn_one() {
                    Ok(replacement) => {
                        self.counters.workers_respawned.fetch_add(1, Ordering::Relaxed);
                        info!(lost = worker_id, replacement, "worker respawned");
                    }
                    Err(err) => error!(lost = worker_id, error = %err, "failed to respawn worker"),
                }
            }
        }
    }
}

struct Monitor {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

fn spawn_monitor(shared: Arc<PoolShared>) -> Result<Monitor, RuntimeError> {
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let interval = shared.config.heartbeat_interval();
    let timeout_ms = shared.config.heartbeat_timeout_ms;
    let handle = thread::Builder::new()
        .name("dispatch-monitor".into())
        .spawn(move || {
            debug!(?interval, timeout_ms, "heartbeat monitor started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let lost = shared.scheduler.sweep_liveness(now_ms(), timeout_ms);
                if !lost.is_empty() {
                    shared.reap(&lost);
                }
            }
            debug!("heartbeat monitor stopped");
        })
        .map_err(|e| RuntimeError::Internal(format!("failed to spawn heartbeat monitor: {e}")))?;
    Ok(Monitor { stop_tx, handle })
}

/// Pool of worker threads attached to one scheduler.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    monitor: Mutex<Option<Monitor>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("stats", &self.stats()).finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a pool without starting any threads.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` if the configuration is invalid.
    pub fn new(
        config: RuntimeConfig,
        scheduler: Arc<Scheduler>,
        store: Arc<ObjectStore>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, RuntimeError> {
        config.validate().map_err(RuntimeError::InvalidConfig)?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                scheduler,
                store,
                executor,
                handles: Mutex::new(HashMap::new()),
                next_worker_id: AtomicUsize::new(0),
                target_workers: AtomicUsize::new(0),
                counters: Arc::new(PoolCounters::default()),
                shutdown: AtomicBool::new(false),
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Start `worker_count` workers (and the heartbeat monitor on first call).
    ///
    /// # Errors
    ///
    /// - `RuntimeError::Shutdown` if the pool was shut down
    /// - `RuntimeError::Internal` if a thread could not be spawned
    pub fn start(&self, worker_count: usize) -> Result<(), RuntimeError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(RuntimeError::Shutdown);
        }
        for _ in 0..worker_count {
            self.shared.spawn_one()?;
            self.shared.target_workers.fetch_add(1, Ordering::Relaxed);
        }

        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            *monitor = Some(spawn_monitor(Arc::clone(&self.shared))?);
        }

        info!(
            worker_count,
            heartbeat_interval_ms = self.shared.config.heartbeat_interval_ms,
            heartbeat_timeout_ms = self.shared.config.heartbeat_timeout_ms,
            "worker pool started"
        );
        Ok(())
    }

    /// Worker threads currently tracked.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.handles.lock().len()
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot(
            self.shared.target_workers.load(Ordering::Relaxed),
            self.live_workers(),
        )
    }

    /// Stop the monitor, close every inbox and join workers.
    ///
    /// Workers finish the task they are running first. Each join gets the
    /// configured budget; workers that don't exit in time are detached.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker pool");

        if let Some(monitor) = self.monitor.lock().take() {
            drop(monitor.stop_tx);
            if monitor.handle.join().is_err() {
                warn!("heartbeat monitor panicked");
            }
        }
        self.shared.scheduler.disconnect_workers();

        let handles: Vec<(WorkerId, JoinHandle<()>)> = self.shared.handles.lock().drain().collect();
        let worker_count = handles.len();
        let budget = self.shared.config.join_timeout();
        for (worker_id, handle) in handles {
            // Join on a helper thread so one stuck worker cannot hang shutdown.
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let _ = tx.send(handle.join().is_ok());
            });
            match rx.recv_timeout(budget) {
                Ok(true) => debug!(worker_id, "Worker joined successfully"),
                Ok(false) => warn!(worker_id, "Worker panicked"),
                Err(_) => {
                    warn!(worker_id, "Worker did not exit within timeout - detaching");
                    continue;
                }
            }
            let _ = join_thread.join();
        }

        info!(worker_count, "Worker pool shut down complete");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal without joining; explicit shutdown() is the graceful path.
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            if let Some(monitor) = self.monitor.lock().take() {
                drop(monitor.stop_tx);
            }
            self.shared.scheduler.disconnect_workers();
            debug!("WorkerPool dropped without explicit shutdown - workers will be detached");
        }
    }
}
