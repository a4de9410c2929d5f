// src/fetch/rate_limit.rs
//! Per-host rate limiting on a keyed GCRA limiter.
//!
//! Burst capacity is `burst`; the steady rate is `max_requests_per_window`
//! per window. A request that finds its host exhausted queues for the next
//! cell, unless that wait exceeds `max_queue_wait_ms`, in which case it is
//! refused with `RateLimited`.

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::config::RateLimitSettings;
use crate::error::FetchError;

/// Timer slack on top of the queue budget so a wait of exactly the budget
/// is not cut off.
const QUEUE_SLACK: Duration = Duration::from_millis(10);

pub struct RateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(s: &RateLimitSettings) -> Self {
        let window = Duration::from_secs(s.window_secs.max(1));
        let period = window / s.max_requests_per_window.max(1);
        let burst = NonZeroU32::new(s.burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        Self {
            limiter: governor::RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            max_wait: Duration::from_millis(s.max_queue_wait_ms),
        }
    }

    /// Take a cell for `host` without waiting. `Err` carries how long until
    /// the next cell frees up.
    pub fn try_acquire(&self, host: &str) -> Result<(), Duration> {
        self.limiter
            .check_key(&host.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Wait for a cell for `host`, queueing up to the configured budget.
    pub async fn acquire(&self, host: &str) -> Result<(), FetchError> {
        let limited = || FetchError::RateLimited {
            host: host.to_string(),
        };
        let wait = match self.try_acquire(host) {
            Ok(()) => return Ok(()),
            Err(wait) => wait,
        };
        if wait > self.max_wait {
            return Err(limited());
        }

        tracing::debug!(target: "fetch", host, wait_ms = wait.as_millis() as u64, "queued for rate limit");
        let key = host.to_string();
        tokio::time::timeout(self.max_wait + QUEUE_SLACK, self.limiter.until_key_ready(&key))
            .await
            .map_err(|_| limited())
    }
}
