//! Tests for custom placement policies plugged into a runtime

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus_dispatch::builders::RuntimeBuilder;
use prometheus_dispatch::config::RuntimeConfig;
use prometheus_dispatch::core::{Arg, Assignment, FunctionRegistry, PlacementPolicy, QueuedTask, WorkerId};
use serde_json::json;

/// Runs the most recently queued task first.
struct NewestFirst;

impl PlacementPolicy for NewestFirst {
    fn pick_worker(&self, queue: &VecDeque<QueuedTask>, idle_workers: &[WorkerId]) -> Option<Assignment> {
        let worker = *idle_workers.first()?;
        let queue_index = queue.len().checked_sub(1)?;
        Some(Assignment { queue_index, worker })
    }

    fn name(&self) -> &'static str {
        "newest-first"
    }
}

#[test]
fn test_custom_policy_controls_dispatch_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let mut registry = FunctionRegistry::new();
    registry.register("record", move |args| {
        std::thread::sleep(Duration::from_millis(20));
        seen.lock().push(args.get::<u64>(0)?);
        Ok(json!(null))
    });

    let runtime = RuntimeBuilder::new()
        .config(RuntimeConfig::new().with_worker_count(1).with_heartbeat(20, 1_000))
        .registry(registry)
        .policy(NewestFirst)
        .start()
        .unwrap();

    let futures: Vec<_> = (0..4_u64)
        .map(|i| runtime.submit("record", [Arg::value(&i).unwrap()]).unwrap())
        .collect();
    runtime.get_many(&futures, Some(Duration::from_secs(5))).unwrap();

    // Task 0 went straight to the idle worker; the rest ran newest first.
    assert_eq!(*order.lock(), vec![0, 3, 2, 1]);
    runtime.stop();
}
