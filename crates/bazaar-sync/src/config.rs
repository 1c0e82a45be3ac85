//! Sync configuration loaded from environment variables.
//!
//! Every setting has a default, so nothing needs to be set for a device to
//! sync.

use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Attempts per cycle before it is abandoned.
    /// Env: `BAZAAR_SYNC_MAX_ATTEMPTS`
    /// Default: `5`
    pub max_attempts: usize,

    /// First retry delay.
    /// Env: `BAZAAR_SYNC_INITIAL_BACKOFF_MS`
    /// Default: `200`
    pub initial_backoff: Duration,

    /// Upper bound on the retry delay.
    /// Env: `BAZAAR_SYNC_MAX_BACKOFF_MS`
    /// Default: `5000`
    pub max_backoff: Duration,

    /// Outbound records per second per peer.
    /// Env: `BAZAAR_RATE_LIMIT_PER_SEC`
    /// Default: `20.0`
    pub rate_limit_per_sec: f64,

    /// Token bucket capacity per peer.
    /// Env: `BAZAAR_RATE_LIMIT_BURST`
    /// Default: `50.0`
    pub rate_limit_burst: f64,

    /// Records per `Records`/`Push` frame.
    /// Env: `BAZAAR_SYNC_CHUNK_SIZE`
    /// Default: `64`
    pub chunk_size: usize,

    /// Buffered change events per subscriber.
    /// Env: `BAZAAR_NOTIFY_CAPACITY`
    /// Default: `256`
    pub notify_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5000),
            rate_limit_per_sec: 20.0,
            rate_limit_burst: 50.0,
            chunk_size: 64,
            notify_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, "BAZAAR_SYNC_MAX_ATTEMPTS", |n| *n > 0) {
            config.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "BAZAAR_SYNC_INITIAL_BACKOFF_MS", |_| true) {
            config.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "BAZAAR_SYNC_MAX_BACKOFF_MS", |_| true) {
            config.max_backoff = Duration::from_millis(ms);
        }
        if let Some(rate) = parse_var::<f64>(&lookup, "BAZAAR_RATE_LIMIT_PER_SEC", |r| {
            r.is_finite() && *r > 0.0
        }) {
            config.rate_limit_per_sec = rate;
        }
        if let Some(burst) = parse_var::<f64>(&lookup, "BAZAAR_RATE_LIMIT_BURST", |b| {
            b.is_finite() && *b >= 1.0
        }) {
            config.rate_limit_burst = burst;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "BAZAAR_SYNC_CHUNK_SIZE", |n| *n > 0) {
            config.chunk_size = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "BAZAAR_NOTIFY_CAPACITY", |n| *n > 0) {
            config.notify_capacity = n;
        }

        if config.max_backoff < config.initial_backoff {
            tracing::warn!(
                initial_ms = config.initial_backoff.as_millis() as u64,
                max_ms = config.max_backoff.as_millis() as u64,
                "max backoff below initial backoff, raising it"
            );
            config.max_backoff = config.initial_backoff;
        }

        config
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: self.initial_backoff,
            max_delay: self.max_backoff,
            factor: 2.0,
            max_attempts: self.max_attempts,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    valid: impl Fn(&T) -> bool,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) if valid(&v) => Some(v),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
