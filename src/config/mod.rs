//! Configuration models for the runtime, worker pool and object store.

pub mod runtime;

pub use runtime::RuntimeConfig;
