//! Builders to construct runtimes from configuration.

pub mod runtime_builder;

pub use runtime_builder::RuntimeBuilder;
