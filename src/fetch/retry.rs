// src/fetch/retry.rs
//! Exponential backoff with full jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::RetrySettings;
use crate::error::FetchError;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(s: &RetrySettings) -> Self {
        Self {
            base: Duration::from_millis(s.base_delay_ms),
            max: Duration::from_millis(s.max_delay_ms),
            max_attempts: s.max_attempts.max(1),
        }
    }

    /// Upper bound of the delay before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Uniform in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.ceiling(attempt).as_millis() as u64;
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=cap))
    }
}

/// Whether another attempt could plausibly succeed.
pub fn is_retryable(e: &FetchError) -> bool {
    match e {
        FetchError::Timeout(_) => true,
        FetchError::Http { status: None, .. } => true,
        FetchError::Http {
            status: Some(code), ..
        } => *code == 408 || *code == 429 || *code >= 500,
        FetchError::RateLimited { .. } | FetchError::BreakerOpen(_) | FetchError::DeadlineExceeded => false,
    }
}
