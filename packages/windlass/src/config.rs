//! Engine configuration.
//!
//! An explicit handle passed to every component — no process-global state.
//! Binaries build it with [`EngineConfig::from_env`]; tests construct it
//! directly with a scoped store.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WindlassError};

/// Retry backoff policy: `next_retry_at = now + base * factor^(retry_count-1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Attempts after which a transiently failing task is failed for good.
    pub max_attempts: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next retry, given the retry count already recorded.
    pub fn delay_for(&self, retry_count: i64) -> Duration {
        let exponent = (retry_count - 1).max(0) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding `windlass.db`.
    pub storage_dir: PathBuf,
    /// Control-plane HTTP port.
    pub http_port: u16,
    /// Scheduler poll interval (pending -> ready promotion).
    pub scheduler_interval: Duration,
    /// Retry poll interval (backing-off -> re-enqueue).
    pub retry_interval: Duration,
    /// Timer sweeper interval (awakeable timeouts + due sleeps).
    pub sweeper_interval: Duration,
    /// Lease reaper interval.
    pub reaper_interval: Duration,
    /// A LEASED queue row with a heartbeat older than this is reaped.
    pub lease_timeout: Duration,
    /// Per-invocation-attempt wall-clock ceiling.
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./windlass-data"),
            http_port: 4097,
            scheduler_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            sweeper_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `WINDLASS_STORAGE_DIR`, `WINDLASS_HTTP_PORT`,
    /// `WINDLASS_SCHEDULER_INTERVAL_MS`, `WINDLASS_RETRY_INTERVAL_MS`,
    /// `WINDLASS_SWEEPER_INTERVAL_MS`, `WINDLASS_REAPER_INTERVAL_MS`,
    /// `WINDLASS_LEASE_TIMEOUT_SEC`, `WINDLASS_ATTEMPT_TIMEOUT_SEC`,
    /// `WINDLASS_RETRY_BASE_MS`, `WINDLASS_RETRY_FACTOR`,
    /// `WINDLASS_RETRY_MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("WINDLASS_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(port) = parse_var::<u16>("WINDLASS_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(ms) = parse_var::<u64>("WINDLASS_SCHEDULER_INTERVAL_MS")? {
            config.scheduler_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("WINDLASS_RETRY_INTERVAL_MS")? {
            config.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("WINDLASS_SWEEPER_INTERVAL_MS")? {
            config.sweeper_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("WINDLASS_REAPER_INTERVAL_MS")? {
            config.reaper_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>("WINDLASS_LEASE_TIMEOUT_SEC")? {
            config.lease_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("WINDLASS_ATTEMPT_TIMEOUT_SEC")? {
            config.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>("WINDLASS_RETRY_BASE_MS")? {
            config.retry.base = Duration::from_millis(ms);
        }
        if let Some(factor) = parse_var::<f64>("WINDLASS_RETRY_FACTOR")? {
            config.retry.factor = factor;
        }
        if let Some(attempts) = parse_var::<i64>("WINDLASS_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| WindlassError::Validation(format!("{name} has invalid value {raw:?}"))),
        Err(_) => Ok(None),
    }
}
