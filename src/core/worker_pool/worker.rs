//! One worker thread: inbox loop, argument resolution and execution.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{debug, error, trace, warn};

use super::PoolCounters;
use crate::core::error::TaskError;
use crate::core::executor::{CallArgs, TaskExecutor};
use crate::core::object_store::{encoded_len, ObjectKey, ObjectOrigin, ObjectStore, WorkerCache};
use crate::core::scheduler::Scheduler;
use crate::core::task::{DispatchMessage, TaskArg, TaskFailure, TaskOutcome, WorkerId};
use crate::util::now_ms;

/// Liveness signal shared between a worker thread and the scheduler.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    last_beat_ms: AtomicU64,
    exited: AtomicBool,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last_beat_ms: AtomicU64::new(now_ms()),
            exited: AtomicBool::new(false),
        }
    }

    pub fn beat(&self) {
        self.last_beat_ms.store(now_ms(), Ordering::Release);
    }

    pub fn last_beat_ms(&self) -> u64 {
        self.last_beat_ms.load(Ordering::Acquire)
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// Sets the exited flag however the thread leaves, unwinding included.
struct ExitGuard(Arc<Heartbeat>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.mark_exited();
    }
}

/// Everything a worker thread owns.
pub(super) struct WorkerContext {
    pub worker_id: WorkerId,
    pub inbox: Receiver<DispatchMessage>,
    pub heartbeat: Arc<Heartbeat>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<ObjectStore>,
    pub executor: Arc<dyn TaskExecutor>,
    pub counters: Arc<PoolCounters>,
    pub heartbeat_interval: Duration,
    pub catch_panics: bool,
}

/// Spawn a worker thread.
pub(super) fn spawn_worker(ctx: WorkerContext, stack_size: usize) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("dispatch-worker-{}", ctx.worker_id))
        .stack_size(stack_size)
        .spawn(move || run(ctx))
}

fn build_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

fn run(ctx: WorkerContext) {
    let _exit = ExitGuard(Arc::clone(&ctx.heartbeat));
    let worker_id = ctx.worker_id;
    debug!(worker_id, "worker thread started");

    // Each worker drives async callables on its own single-threaded runtime.
    let mut rt = match build_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker_id, error = %e, "failed to create worker runtime");
            return;
        }
    };
    let mut cache = WorkerCache::new(Arc::clone(&ctx.store));

    loop {
        let message = match ctx.inbox.recv_timeout(ctx.heartbeat_interval) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => {
                ctx.heartbeat.beat();
                let dropped = cache.apply_deletions();
                if dropped > 0 {
                    trace!(worker_id, dropped, "idle worker dropped deleted entries");
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!(worker_id, "worker channel closed, exiting");
                break;
            }
        };

        ctx.heartbeat.beat();
        let task_id = message.task_id;
        debug!(worker_id, task_id, callable = %message.callable, "worker executing task");

        let (outcome, panicked) = execute(&ctx, &rt, &mut cache, message);
        ctx.counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
        if matches!(outcome, TaskOutcome::Failed(_)) {
            ctx.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }

        // Beat before reporting: the report makes this worker idle again.
        ctx.heartbeat.beat();
        ctx.scheduler.report(worker_id, task_id, outcome);

        if panicked {
            ctx.counters.panics_caught.fetch_add(1, Ordering::Relaxed);
            rt = match build_runtime() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to rebuild worker runtime after panic");
                    return;
                }
            };
        }
    }

    debug!(worker_id, cache = ?cache.stats(), "worker thread exiting");
}

/// Run one task. The flag reports whether a panic was caught.
fn execute(ctx: &WorkerContext, rt: &Runtime, cache: &mut WorkerCache, message: DispatchMessage) -> (TaskOutcome, bool) {
    let args = match resolve_args(cache, message.args) {
        Ok(args) => args,
        Err(key) => {
            warn!(worker_id = ctx.worker_id, task_id = message.task_id, %key, "argument entry missing");
            return (TaskOutcome::Failed(TaskFailure::MissingObject(key)), false);
        }
    };

    let callable = message.callable.as_str();
    let call = || rt.block_on(ctx.executor.execute(callable, args));
    let (result, panicked) = if ctx.catch_panics {
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(result) => (result, false),
            Err(payload) => {
                let cause = TaskError::from_panic(payload.as_ref());
                warn!(worker_id = ctx.worker_id, task_id = message.task_id, %cause, "callable panicked");
                (Err(cause), true)
            }
        }
    } else {
        (call(), false)
    };

    (store_result(ctx, result), panicked)
}

fn resolve_args(cache: &mut WorkerCache, args: Vec<TaskArg>) -> Result<CallArgs, ObjectKey> {
    args.into_iter()
        .map(|arg| match arg {
            TaskArg::Inline(value) => Ok(Arc::new(value)),
            TaskArg::Stored(key) => cache.get(key).map_err(|_| key),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(CallArgs::new)
}

fn store_result(ctx: &WorkerContext, result: Result<Value, TaskError>) -> TaskOutcome {
    match result {
        Ok(value) => match encoded_len(&value) {
            Ok(size) => TaskOutcome::Completed(ctx.store.put_sized(value, size, ObjectOrigin::Worker(ctx.worker_id))),
            Err(err) => TaskOutcome::Failed(TaskFailure::Error(TaskError::new("serialization", err.to_string()))),
        },
        Err(cause) => TaskOutcome::Failed(TaskFailure::Error(cause)),
    }
}
