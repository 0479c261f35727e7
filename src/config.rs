//! Configuration for the rate-limiting and batching core.
//!
//! The core reads no files or environment variables; callers construct a
//! [`CoreConfig`] from whatever configuration layer they already have and
//! validation happens once, at component construction.

use std::time::Duration;

use crate::error::{Result, VolleyError};

/// Configuration accepted by [`RateLimiter`](crate::RateLimiter) and
/// [`BatchAggregator`](crate::BatchAggregator).
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum requests admitted per user within one window
    pub max_requests_per_window: u32,

    /// Length of the fixed counting window
    pub window_length: Duration,

    /// Queue size that triggers an immediate batch flush
    pub batch_size_threshold: usize,

    /// Maximum time a batch waits after its first entry before flushing
    pub batch_timeout: Duration,

    /// How often the background sweeper evicts idle per-user buckets
    pub sweep_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 10,
            window_length: Duration::from_secs(3600),
            batch_size_threshold: 10,
            batch_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl CoreConfig {
    /// Validate that the configuration is well-formed.
    ///
    /// Non-positive thresholds or durations are fatal at startup, never at
    /// request time.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests_per_window == 0 {
            return Err(VolleyError::InvalidConfiguration(
                "max_requests_per_window must be > 0".to_string(),
            ));
        }
        if self.window_length.is_zero() {
            return Err(VolleyError::InvalidConfiguration(
                "window_length must be > 0".to_string(),
            ));
        }
        if self.batch_size_threshold == 0 {
            return Err(VolleyError::InvalidConfiguration(
                "batch_size_threshold must be > 0".to_string(),
            ));
        }
        if self.batch_timeout.is_zero() {
            return Err(VolleyError::InvalidConfiguration(
                "batch_timeout must be > 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(VolleyError::InvalidConfiguration(
                "sweep_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
