//! Function registry.
//!
//! Maps stable names (e.g. `"fib"`, `"blur"`) to callables. The registry is
//! populated before the runtime starts and is read-only afterwards; the
//! scheduler validates submissions against it and workers dispatch by name,
//! never by shipping closures.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::{SubmissionError, TaskError};
use crate::core::executor::{CallArgs, TaskExecutor};

type BlockingFn = Arc<dyn Fn(CallArgs) -> anyhow::Result<Value> + Send + Sync>;

type AsyncFn =
    Arc<dyn Fn(CallArgs) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> + Send + Sync>;

#[derive(Clone)]
enum Callable {
    Blocking(BlockingFn),
    Async(AsyncFn),
}

#[derive(Clone)]
struct RegisteredFunction {
    arity: Option<usize>,
    callable: Callable,
}

/// Registry holding the mapping between callable names and their implementation.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blocking callable accepting any number of arguments.
    pub fn register<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(CallArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, None, Callable::Blocking(Arc::new(f)))
    }

    /// Register a blocking callable that must receive exactly `arity` arguments.
    pub fn register_with_arity<F>(&mut self, name: &str, arity: usize, f: F) -> &mut Self
    where
        F: Fn(CallArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, Some(arity), Callable::Blocking(Arc::new(f)))
    }

    /// Register an async callable, driven by the worker's own runtime.
    pub fn register_async<F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        // Box::pin erases the concrete future type so different async
        // functions share one map.
        let f: AsyncFn = Arc::new(move |args: CallArgs| {
            Box::pin(f(args)) as Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>
        });
        self.insert(name, None, Callable::Async(f))
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered callables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn insert(&mut self, name: &str, arity: Option<usize>, callable: Callable) -> &mut Self {
        if self
            .functions
            .insert(name.to_string(), RegisteredFunction { arity, callable })
            .is_some()
        {
            tracing::warn!(callable = name, "replaced previously registered callable");
        } else {
            tracing::debug!(callable = name, "registered callable");
        }
        self
    }
}

#[async_trait]
impl TaskExecutor for FunctionRegistry {
    fn validate(&self, callable: &str, arg_count: usize) -> Result<(), SubmissionError> {
        let function = self
            .functions
            .get(callable)
            .ok_or_else(|| SubmissionError::UnknownCallable(callable.to_string()))?;
        match function.arity {
            Some(arity) if arity != arg_count => Err(SubmissionError::MalformedArguments(format!(
                "`{callable}` takes {arity} argument(s), got {arg_count}"
            ))),
            _ => Ok(()),
        }
    }

    async fn execute(&self, callable: &str, args: CallArgs) -> Result<Value, TaskError> {
        let function = self
            .functions
            .get(callable)
            .ok_or_else(|| TaskError::new("unknown_callable", callable))?;
        let result = match &function.callable {
            Callable::Blocking(f) => f(args),
            Callable::Async(f) => f(args).await,
        };
        result.map_err(|e| TaskError::from_anyhow(&e))
    }
}
