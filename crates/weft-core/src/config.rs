//! Engine configuration
//!
//! Defaults are production-safe; every knob can be overridden from the
//! environment by the embedding server.

use std::time::Duration;

use log::warn;

/// Tunables for the engine. Constructed once and injected.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size per run unless overridden at submit.
    pub worker_pool_default: usize,
    /// Runs still `running` past this lifetime are reaped as orphaned.
    pub run_max_lifetime: Duration,
    /// Base delay of the retry backoff schedule.
    pub retry_backoff_base: Duration,
    /// Upper bound on any single retry delay.
    pub retry_backoff_cap: Duration,
    /// Per-subscriber event queue depth before drop-oldest kicks in.
    pub event_queue_depth: usize,
    /// How long the executor waits for in-flight steps after a cancel.
    pub cancel_grace: Duration,
    /// Executor lease duration; heartbeated at half this interval.
    pub lease_duration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_default: 8,
            run_max_lifetime: Duration::from_secs(24 * 3600),
            retry_backoff_base: Duration::from_millis(250),
            retry_backoff_cap: Duration::from_millis(30_000),
            event_queue_depth: 1024,
            cancel_grace: Duration::from_secs(5),
            lease_duration: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Reads `ENGINE_*` overrides from the environment, keeping defaults
    /// for anything unset or unparseable (with a warning).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = read_env::<usize>("ENGINE_WORKER_POOL_DEFAULT") {
            if n == 0 {
                warn!("ENGINE_WORKER_POOL_DEFAULT must be >= 1, keeping {}", config.worker_pool_default);
            } else {
                config.worker_pool_default = n;
            }
        }
        if let Some(secs) = read_env::<u64>("ENGINE_RUN_MAX_LIFETIME") {
            config.run_max_lifetime = Duration::from_secs(secs);
        }
        if let Some(ms) = read_env::<u64>("ENGINE_RETRY_BACKOFF_BASE_MS") {
            config.retry_backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = read_env::<u64>("ENGINE_RETRY_BACKOFF_CAP_MS") {
            config.retry_backoff_cap = Duration::from_millis(ms);
        }
        if let Some(depth) = read_env::<usize>("ENGINE_EVENT_BUS_QUEUE_DEPTH") {
            if depth == 0 {
                warn!("ENGINE_EVENT_BUS_QUEUE_DEPTH must be >= 1, keeping {}", config.event_queue_depth);
            } else {
                config.event_queue_depth = depth;
            }
        }
        config
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparseable {name}={raw}");
            None
        }
    }
}
