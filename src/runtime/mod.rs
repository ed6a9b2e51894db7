//! Client API: start a runtime, submit work, fetch results, stop.

pub mod handle;

pub use handle::{RuntimeHandle, RuntimeStats};
