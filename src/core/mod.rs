//! Core runtime components: object store, futures, scheduler and worker pool.

pub mod error;
pub mod executor;
pub mod future;
pub mod object_store;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod worker_pool;

pub use error::{AppResult, RuntimeError, SubmissionError, TaskError};
pub use executor::{CallArgs, TaskExecutor};
pub use future::{get_many, get_many_async, TaskFuture};
pub use object_store::{encoded_len, CacheStats, ObjectKey, ObjectOrigin, ObjectStore, StoreStats, WorkerCache};
pub use policy::{Assignment, FifoPolicy, PlacementPolicy, QueuedTask};
pub use registry::FunctionRegistry;
pub use scheduler::{Scheduler, SchedulerSnapshot, SchedulerStats};
pub use task::{Arg, DispatchMessage, TaskArg, TaskFailure, TaskId, TaskOutcome, TaskState, WorkerId};
pub use worker_pool::{PoolStats, WorkerPool};
