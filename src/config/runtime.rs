//! Runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix of the environment variables read by [`RuntimeConfig::from_env`].
pub const ENV_PREFIX: &str = "DISPATCH_";

/// Runtime configuration.
///
/// Every field has a default, so JSON input may name only the fields it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Encoded argument size (bytes) above which values are moved into the object store.
    pub inline_threshold_bytes: usize,
    /// Maximum queued (not yet dispatched) tasks before submissions are rejected.
    pub max_queue_depth: usize,
    /// Worker heartbeat period and monitor tick, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Idle staleness after which a worker is declared lost, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Stack size for worker threads (bytes).
    pub thread_stack_size: usize,
    /// Per-worker join budget during shutdown, in milliseconds.
    pub join_timeout_ms: u64,
    /// Report callable panics as task failures instead of letting them kill the worker.
    pub catch_panics: bool,
    /// Replace workers the heartbeat monitor declares lost.
    pub respawn_lost_workers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            inline_threshold_bytes: 100 * 1024,
            max_queue_depth: 10_000,
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 5_000,
            thread_stack_size: 2 * 1024 * 1024,
            join_timeout_ms: 2_000,
            catch_panics: true,
            respawn_lost_workers: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the inlining threshold.
    #[must_use]
    pub const fn with_inline_threshold_bytes(mut self, bytes: usize) -> Self {
        self.inline_threshold_bytes = bytes;
        self
    }

    /// Set the maximum queue depth.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set heartbeat interval and timeout.
    #[must_use]
    pub const fn with_heartbeat(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_timeout_ms = timeout_ms;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the per-worker join budget used by shutdown.
    #[must_use]
    pub const fn with_join_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.join_timeout_ms = timeout_ms;
        self
    }

    /// Choose whether callable panics are caught.
    #[must_use]
    pub const fn with_catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }

    /// Choose whether lost workers are replaced.
    #[must_use]
    pub const fn with_respawn_lost_workers(mut self, respawn: bool) -> Self {
        self.respawn_lost_workers = respawn;
        self
    }

    /// Heartbeat period as a `Duration`.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout as a `Duration`.
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Join budget as a `Duration`.
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than 0".into());
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err("heartbeat_timeout_ms must be greater than heartbeat_interval_ms".into());
        }
        if self.thread_stack_size == 0 {
            return Err("thread_stack_size must be greater than 0".into());
        }
        if self.join_timeout_ms == 0 {
            return Err("join_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from defaults overridden by `DISPATCH_*` environment
    /// variables (a `.env` file is loaded first if present), then validate.
    ///
    /// Recognised variables: `DISPATCH_WORKER_COUNT`, `DISPATCH_INLINE_THRESHOLD_BYTES`,
    /// `DISPATCH_MAX_QUEUE_DEPTH`, `DISPATCH_HEARTBEAT_INTERVAL_MS`,
    /// `DISPATCH_HEARTBEAT_TIMEOUT_MS`, `DISPATCH_THREAD_STACK_SIZE`,
    /// `DISPATCH_JOIN_TIMEOUT_MS`, `DISPATCH_CATCH_PANICS`, `DISPATCH_RESPAWN_LOST_WORKERS`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse, or a validation message.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse, or a validation message.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            field: &str,
            target: &mut T,
        ) -> Result<(), String>
        where
            T::Err: std::fmt::Display,
        {
            let name = format!("{ENV_PREFIX}{field}");
            if let Some(raw) = lookup(&name) {
                *target = raw
                    .trim()
                    .parse()
                    .map_err(|e| format!("{name}: cannot parse `{raw}`: {e}"))?;
            }
            Ok(())
        }

        let mut cfg = Self::default();
        parse(&lookup, "WORKER_COUNT", &mut cfg.worker_count)?;
        parse(&lookup, "INLINE_THRESHOLD_BYTES", &mut cfg.inline_threshold_bytes)?;
        parse(&lookup, "MAX_QUEUE_DEPTH", &mut cfg.max_queue_depth)?;
        parse(&lookup, "HEARTBEAT_INTERVAL_MS", &mut cfg.heartbeat_interval_ms)?;
        parse(&lookup, "HEARTBEAT_TIMEOUT_MS", &mut cfg.heartbeat_timeout_ms)?;
        parse(&lookup, "THREAD_STACK_SIZE", &mut cfg.thread_stack_size)?;
        parse(&lookup, "JOIN_TIMEOUT_MS", &mut cfg.join_timeout_ms)?;
        parse(&lookup, "CATCH_PANICS", &mut cfg.catch_panics)?;
        parse(&lookup, "RESPAWN_LOST_WORKERS", &mut cfg.respawn_lost_workers)?;
        cfg.validate()?;
        Ok(cfg)
    }
}
