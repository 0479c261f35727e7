//! Per-user fixed-window rate limiting.
//!
//! Each user gets a lazily created [`UsageWindow`] bucket. The admission
//! check and the increment happen under one per-shard lock, so two
//! concurrent calls for the same user can never both take the last slot.
//! Contention is per-user (per dashmap shard), never a single global lock.
//!
//! The algorithm is a fixed-window counter: bursts are possible at window
//! boundaries, which is acceptable because the cost driver is total requests
//! per window, not burst smoothness.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::{Result, VolleyError};

/// Outcome of an admission check.
///
/// Both variants are normal results: a rejected request is expected traffic,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The request was counted and may proceed
    Admitted {
        /// Slots left in the current window after this request
        remaining: u32,
        /// When the current window expires
        reset_at: DateTime<Utc>,
    },

    /// The window is full; the request was not counted
    Rejected {
        /// How long until the window resets
        retry_after: Duration,
    },
}

impl Decision {
    /// Check if the request was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// Read-only usage snapshot for a user, for "check your quota" queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStatus {
    /// Requests admitted in the current window
    pub used: u32,
    /// Slots left in the current window
    pub remaining: u32,
    /// When the current window expires; `None` if the user has no live window
    pub reset_at: Option<DateTime<Utc>>,
}

impl UsageStatus {
    /// Check if the next request would be rejected.
    pub fn is_limited(&self) -> bool {
        self.remaining == 0
    }
}

/// Per-user counting state.
#[derive(Debug, Clone, Copy)]
struct UsageWindow {
    window_start: DateTime<Utc>,
    request_count: u32,
}

struct LimiterInner {
    max_requests: u32,
    window_length: TimeDelta,
    sweep_interval: Duration,
    buckets: DashMap<String, UsageWindow>,
}

/// Per-user fixed-window rate limiter.
///
/// Cloning is cheap and all clones share the same bucket store, so one
/// limiter can be handed to every command handler. The store is owned by the
/// instance; separate instances are fully isolated, which is what tests rely
/// on.
///
/// # Example
/// ```ignore
/// let limiter = RateLimiter::new(&CoreConfig::default())?;
/// match limiter.check_and_increment(user_id, clock.now()) {
///     Decision::Admitted { remaining, .. } => { /* proceed */ }
///     Decision::Rejected { retry_after } => { /* tell the user */ }
/// }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if the config fails validation.
    pub fn new(config: &CoreConfig) -> Result<Self> {
        config.validate()?;

        let window_length = TimeDelta::from_std(config.window_length).map_err(|e| {
            VolleyError::InvalidConfiguration(format!("window_length out of range: {}", e))
        })?;

        info!(
            max_requests = config.max_requests_per_window,
            window_secs = config.window_length.as_secs(),
            "Rate limiter initialized"
        );

        Ok(Self {
            inner: Arc::new(LimiterInner {
                max_requests: config.max_requests_per_window,
                window_length,
                sweep_interval: config.sweep_interval,
                buckets: DashMap::new(),
            }),
        })
    }

    /// Decide whether a request from `user_id` at `now` is admitted, and
    /// count it if so.
    ///
    /// This is the only mutator. The bucket entry reference holds its shard
    /// write lock, so the read-modify-write below is atomic per user. An
    /// unknown `user_id` gets a fresh bucket rather than an error.
    #[instrument(skip(self, now, user_id), fields(user_id = %user_id))]
    pub fn check_and_increment(&self, user_id: &str, now: DateTime<Utc>) -> Decision {
        let mut bucket = self
            .inner
            .buckets
            .entry(user_id.to_string())
            .or_insert(UsageWindow {
                window_start: now,
                request_count: 0,
            });

        if now - bucket.window_start >= self.inner.window_length {
            bucket.window_start = now;
            bucket.request_count = 0;
        }

        let reset_at = bucket.window_start + self.inner.window_length;

        if bucket.request_count < self.inner.max_requests {
            bucket.request_count += 1;
            let remaining = self.inner.max_requests - bucket.request_count;
            debug!(
                used = bucket.request_count,
                remaining, "Request admitted"
            );
            Decision::Admitted {
                remaining,
                reset_at,
            }
        } else {
            let retry_after = (reset_at - now).to_std().unwrap_or_default();
            warn!(
                used = bucket.request_count,
                max = self.inner.max_requests,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
            Decision::Rejected { retry_after }
        }
    }

    /// Get a user's usage without mutating anything.
    ///
    /// Does not create a bucket for unknown users and does not reset expired
    /// windows; an expired window reads as fresh quota.
    pub fn peek_status(&self, user_id: &str, now: DateTime<Utc>) -> UsageStatus {
        match self.inner.buckets.get(user_id) {
            Some(bucket) if now - bucket.window_start < self.inner.window_length => UsageStatus {
                used: bucket.request_count,
                remaining: self.inner.max_requests.saturating_sub(bucket.request_count),
                reset_at: Some(bucket.window_start + self.inner.window_length),
            },
            _ => UsageStatus {
                used: 0,
                remaining: self.inner.max_requests,
                reset_at: None,
            },
        }
    }

    /// Drop a user's bucket, giving them a fresh window immediately.
    ///
    /// Returns whether a bucket existed. Used by operator reset commands.
    pub fn reset_user(&self, user_id: &str) -> bool {
        let existed = self.inner.buckets.remove(user_id).is_some();
        if existed {
            info!(user_id = %user_id, "Rate limit reset");
        }
        existed
    }

    /// Evict buckets whose window expired more than one full window ago.
    ///
    /// Returns the number of evicted buckets. Buckets inside or just past
    /// their window are kept so `peek_status` stays accurate for recent
    /// users.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.inner.window_length * 2;
        // Count inside the closure; inserts running concurrently with the
        // retain make a before/after length diff unreliable.
        let mut evicted = 0;
        self.inner.buckets.retain(|_, w| {
            let keep = now - w.window_start < cutoff;
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            info!(evicted, "Evicted idle rate-limit buckets");
        }
        evicted
    }

    /// Number of live buckets. Exposed for status surfaces and tests.
    pub fn tracked_users(&self) -> usize {
        self.inner.buckets.len()
    }

    /// Spawn a background task that runs [`sweep_idle`](Self::sweep_idle)
    /// every `sweep_interval`.
    ///
    /// Returns a JoinHandle; abort it to stop the sweeper.
    pub fn spawn_sweeper(&self, clock: Arc<dyn Clock>) -> JoinHandle<()> {
        let limiter = self.clone();
        let interval = limiter.inner.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the first sweep
            // waits a full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep_idle(clock.now());
            }
        })
    }
}
