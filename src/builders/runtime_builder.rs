//! Builder for [`RuntimeHandle`].

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::core::error::RuntimeError;
use crate::core::executor::TaskExecutor;
use crate::core::policy::{FifoPolicy, PlacementPolicy};
use crate::core::registry::FunctionRegistry;
use crate::runtime::RuntimeHandle;

/// Assemble a runtime from configuration, callables and a placement policy.
///
/// ```rust,ignore
/// let runtime = RuntimeBuilder::new()
///     .config(RuntimeConfig::from_env()?)
///     .registry(registry)
///     .start()?;
/// ```
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    executor: Option<Arc<dyn TaskExecutor>>,
    policy: Box<dyn PlacementPolicy>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .field("has_executor", &self.executor.is_some())
            .field("policy", &self.policy.name())
            .finish()
    }
}

impl RuntimeBuilder {
    /// Default configuration, FIFO placement, no callables yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            executor: None,
            policy: Box::new(FifoPolicy),
        }
    }

    /// Use this configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Shorthand for overriding the worker count.
    #[must_use]
    pub fn workers(mut self, worker_count: usize) -> Self {
        self.config.worker_count = worker_count;
        self
    }

    /// Run callables from this registry.
    #[must_use]
    pub fn registry(self, registry: FunctionRegistry) -> Self {
        self.executor(Arc::new(registry))
    }

    /// Run callables through a custom executor.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the placement policy.
    #[must_use]
    pub fn policy(mut self, policy: impl PlacementPolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Validate and start the runtime.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::InvalidConfig` if no registry/executor was given or the
    ///   configuration is invalid
    /// - `RuntimeError::Internal` if worker threads could not be spawned
    pub fn start(self) -> Result<RuntimeHandle, RuntimeError> {
        let executor = self
            .executor
            .ok_or_else(|| RuntimeError::InvalidConfig("no registry or executor configured".into()))?;
        RuntimeHandle::start_with(self.config, executor, self.policy)
    }
}
