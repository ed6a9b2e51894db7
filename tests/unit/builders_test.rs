//! Tests for builder modules

use prometheus_dispatch::builders::RuntimeBuilder;
use prometheus_dispatch::config::RuntimeConfig;
use prometheus_dispatch::core::{Arg, FunctionRegistry, RuntimeError};
use serde_json::json;

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("neg", |args| Ok(json!(-args.get::<i64>(0)?)));
    registry
}

#[test]
fn test_runtime_builder_requires_callables() {
    let err = RuntimeBuilder::new().workers(1).start().unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidConfig(_)));
}

#[test]
fn test_runtime_builder_validates_config() {
    let err = RuntimeBuilder::new()
        .config(RuntimeConfig::new().with_max_queue_depth(0))
        .registry(registry())
        .start()
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidConfig(_)));
}

#[test]
fn test_runtime_builder_starts_runtime() {
    let runtime = RuntimeBuilder::new()
        .config(RuntimeConfig::new().with_heartbeat(20, 1_000))
        .workers(2)
        .registry(registry())
        .start()
        .unwrap();

    assert_eq!(runtime.config().worker_count, 2);
    let future = runtime.submit("neg", [Arg::Value(json!(5))]).unwrap();
    assert_eq!(*runtime.get(&future).unwrap(), json!(-5));
    runtime.stop();
}
