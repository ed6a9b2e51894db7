//! Tests for utility functions

use prometheus_dispatch::util::{init_tracing, now_ms};

#[test]
fn test_now_ms_advances() {
    let before = now_ms();
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert!(now_ms() >= before + 5);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
}
