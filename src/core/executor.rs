//! Task execution trait used by workers and the argument view handed to callables.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::error::{SubmissionError, TaskError};

/// Resolved arguments of one invocation, in submission order.
///
/// Stored arguments arrive as shared references to the worker's cached copy,
/// so large inputs are not cloned per task.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    values: Vec<Arc<Value>>,
}

impl CallArgs {
    /// Wrap already-resolved argument values.
    #[must_use]
    pub const fn new(values: Vec<Arc<Value>>) -> Self {
        Self { values }
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the call has no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw argument at `index`.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    pub fn value(&self, index: usize) -> anyhow::Result<&Value> {
        self.values
            .get(index)
            .map(AsRef::as_ref)
            .ok_or_else(|| anyhow::anyhow!("missing argument {index} (got {})", self.values.len()))
    }

    /// Argument at `index` deserialized into `T`.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range or the value does not match `T`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self.value(index)?;
        T::deserialize(value).map_err(|e| anyhow::anyhow!("argument {index}: {e}"))
    }
}

/// Abstraction for validating and executing named callables.
///
/// The scheduler calls [`TaskExecutor::validate`] at submission time; workers
/// call [`TaskExecutor::execute`] from their dedicated threads.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_dispatch::core::{CallArgs, SubmissionError, TaskError, TaskExecutor};
///
/// struct Echo;
///
/// #[async_trait]
/// impl TaskExecutor for Echo {
///     fn validate(&self, _callable: &str, _arg_count: usize) -> Result<(), SubmissionError> {
///         Ok(())
///     }
///
///     async fn execute(&self, _callable: &str, args: CallArgs) -> Result<serde_json::Value, TaskError> {
///         Ok(args.value(0).cloned().unwrap_or_default())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Check that `callable` exists and accepts `arg_count` arguments.
    ///
    /// # Errors
    ///
    /// `SubmissionError::UnknownCallable` or `SubmissionError::MalformedArguments`.
    fn validate(&self, callable: &str, arg_count: usize) -> Result<(), SubmissionError>;

    /// Run `callable` with resolved arguments.
    ///
    /// # Threading
    ///
    /// Called from a worker thread inside that worker's single-threaded tokio
    /// runtime, so CPU-bound work never blocks the caller's runtime.
    async fn execute(&self, callable: &str, args: CallArgs) -> Result<Value, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_args_typed_access() {
        let args = CallArgs::new(vec![Arc::new(json!(30)), Arc::new(json!([1.5, 2.5]))]);
        assert_eq!(args.len(), 2);
        assert_eq!(args.get::<u32>(0).unwrap(), 30);
        assert_eq!(args.get::<Vec<f64>>(1).unwrap(), vec![1.5, 2.5]);
    }

    #[test]
    fn test_call_args_errors_are_descriptive() {
        let args = CallArgs::new(vec![Arc::new(json!("not a number"))]);
        let err = args.get::<u32>(0).unwrap_err().to_string();
        assert!(err.starts_with("argument 0:"), "{err}");

        let err = args.value(3).unwrap_err().to_string();
        assert_eq!(err, "missing argument 3 (got 1)");
    }
}
