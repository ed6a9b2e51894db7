//! # Prometheus Dispatch
//!
//! An in-process distributed task execution core: submit named functions with
//! arguments, get futures back immediately, and collect results from a pool of
//! dedicated worker threads.
//!
//! ## Core Problem Solved
//!
//! Notebook-style workloads (recursive numerics, Monte-Carlo sampling, image
//! transforms) want to fan work out across cores without managing threads:
//!
//! - **Non-blocking submission**: `submit` returns a [`core::TaskFuture`] at once
//! - **Shared object store**: large inputs are stored once and referenced by key
//!   from any number of tasks; results live in the same store
//! - **Failure surfacing**: a callable's error, a panic or a dead worker is
//!   reported through the future instead of taking the runtime down
//!
//! ## Key Features
//!
//! - **Function registry**: callables are registered by name before start,
//!   blocking or async, optionally arity-checked
//! - **FIFO scheduling** behind a pluggable [`core::PlacementPolicy`]
//! - **Worker pool**: OS threads, each with its own current-thread tokio runtime,
//!   heartbeat liveness monitoring and optional respawn
//! - **Worker-local caching** of store entries, invalidated on deletion
//! - **Blocking and async** `get` / `get_many`
//!
//! ## Example
//!
//! ```rust,ignore
//! use prometheus_dispatch::prelude::*;
//! use serde_json::json;
//!
//! let mut registry = FunctionRegistry::new();
//! registry.register_with_arity("fib", 1, |args| Ok(json!(fib(args.get::<u64>(0)?))));
//!
//! let runtime = RuntimeBuilder::new()
//!     .config(RuntimeConfig::new().with_worker_count(4))
//!     .registry(registry)
//!     .start()?;
//!
//! let futures = [10_u64, 20, 30]
//!     .iter()
//!     .map(|n| runtime.submit("fib", [Arg::value(n)?]))
//!     .collect::<Result<Vec<_>, _>>()?;
//! let values = runtime.get_many(&futures, None)?;
//! runtime.stop();
//! ```
//!
//! For complete scenarios, see `tests/notebook_scenarios_test.rs`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct runtimes from configuration.
pub mod builders;
/// Configuration models for the runtime.
pub mod config;
/// Object store, futures, scheduler and worker pool.
pub mod core;
/// Client-facing runtime handle.
pub mod runtime;
/// Shared utilities.
pub mod util;

/// Everything needed to register callables, start a runtime and use it.
pub mod prelude {
    pub use crate::builders::RuntimeBuilder;
    pub use crate::config::RuntimeConfig;
    pub use crate::core::{
        Arg, CallArgs, FunctionRegistry, ObjectKey, RuntimeError, SubmissionError, TaskError, TaskFuture,
    };
    pub use crate::runtime::{RuntimeHandle, RuntimeStats};
}
