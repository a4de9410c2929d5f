// src/fetch/mod.rs
//! Resilient source fetching: body cache, circuit breaker, per-host rate
//! limit, per-attempt timeout and bounded retries.

pub mod circuit_breaker;
pub mod http;
pub mod rate_limit;
pub mod retry;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use metrics::{counter, histogram};
use std::sync::Arc;
use tokio::time::Instant;

use crate::cache::{body_key, MultiTierCache};
use crate::config::AggregatorSettings;
use crate::error::FetchError;
use crate::reputation::{AttemptOutcome, ReputationHandle};
use crate::types::Source;

pub use circuit_breaker::{Admission, BreakerState, CircuitBreakers};
pub use http::{HttpClient, HttpResponse, MockHttpClient, MockReply, ReqwestClient};
pub use rate_limit::RateLimiter;
pub use retry::Backoff;

/// What one source yielded this cycle.
#[derive(Debug, Clone)]
pub struct RawFetchResult {
    pub source_id: String,
    pub result: Result<Vec<u8>, FetchError>,
    pub fetched_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub http_status: Option<u16>,
    pub attempts: u32,
    pub from_cache: bool,
}

impl RawFetchResult {
    fn failed(source_id: &str, e: FetchError, started: Instant, attempts: u32, status: Option<u16>) -> Self {
        Self {
            source_id: source_id.to_string(),
            result: Err(e),
            fetched_at: Utc::now(),
            latency_ms: started.elapsed().as_millis() as u64,
            http_status: status,
            attempts,
            from_cache: false,
        }
    }
}

pub struct Fetcher {
    client: Arc<dyn HttpClient>,
    cache: Arc<MultiTierCache>,
    limiter: RateLimiter,
    breakers: CircuitBreakers,
    backoff: Backoff,
    settings: Arc<AggregatorSettings>,
    events: Option<ReputationHandle>,
}

impl Fetcher {
    pub fn new(
        client: Arc<dyn HttpClient>,
        cache: Arc<MultiTierCache>,
        settings: Arc<AggregatorSettings>,
        events: Option<ReputationHandle>,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(&settings.rate_limit),
            breakers: CircuitBreakers::new(&settings.breaker),
            backoff: Backoff::new(&settings.retry),
            client,
            cache,
            settings,
            events,
        }
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    fn emit(&self, source: &Source, outcome: AttemptOutcome, latency_ms: u64) {
        counter!("aggregator_fetch_attempts_total", "outcome" => outcome.as_str()).increment(1);
        if let Some(events) = &self.events {
            events.attempt(&source.id, outcome, latency_ms);
        }
    }

    /// Fetch one source. Never panics, never returns early without a result.
    pub async fn fetch(&self, source: &Source, deadline: Option<Instant>) -> RawFetchResult {
        let started = Instant::now();
        let key = body_key(&source.id);

        if let Some(body) = self.cache.get(&key).await {
            tracing::debug!(target: "fetch", source = %source.id, bytes = body.len(), "body cache hit");
            return RawFetchResult {
                source_id: source.id.clone(),
                result: Ok(body),
                fetched_at: Utc::now(),
                latency_ms: 0,
                http_status: None,
                attempts: 0,
                from_cache: true,
            };
        }

        let host = source.host();
        let timeout = self.settings.fetch.timeout();
        let max_bytes = self.settings.fetch.max_body_bytes;
        let mut last_err: Option<FetchError> = None;
        let mut last_status = None;
        let mut attempts = 0u32;

        while attempts < self.backoff.max_attempts {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }

            let trial = match self.breakers.admit(&source.id) {
                Admission::Rejected => {
                    self.emit(source, AttemptOutcome::BreakerOpen, 0);
                    // A breaker tripped by this very fetch keeps the real cause.
                    last_err.get_or_insert(FetchError::BreakerOpen(source.id.clone()));
                    break;
                }
                Admission::Trial => true,
                Admission::Allowed => false,
            };

            if let Err(e) = self.limiter.acquire(&host).await {
                if trial {
                    self.breakers.abandon_trial(&source.id);
                }
                self.emit(source, AttemptOutcome::RateLimited, 0);
                tracing::debug!(target: "fetch", source = %source.id, host = %host, "rate limited");
                last_err = Some(e);
                break;
            }

            attempts += 1;
            let t0 = Instant::now();
            let outcome = tokio::time::timeout(timeout, self.client.get(&source.url, max_bytes)).await;
            let latency_ms = t0.elapsed().as_millis() as u64;
            histogram!("aggregator_fetch_latency_seconds").record(t0.elapsed().as_secs_f64());

            let err = match outcome {
                Ok(Ok(resp)) => {
                    self.breakers.record_success(&source.id);
                    self.emit(source, AttemptOutcome::Success, latency_ms);
                    self.cache
                        .set(&key, resp.body.clone(), self.settings.cache.ttl_for(source.tier))
                        .await;
                    counter!("aggregator_fetch_bytes_total").increment(resp.body.len() as u64);
                    return RawFetchResult {
                        source_id: source.id.clone(),
                        result: Ok(resp.body),
                        fetched_at: Utc::now(),
                        latency_ms,
                        http_status: Some(resp.status),
                        attempts,
                        from_cache: false,
                    };
                }
                Ok(Err(FetchError::Timeout(_))) | Err(_) => FetchError::Timeout(timeout.as_millis() as u64),
                Ok(Err(e)) => e,
            };

            self.breakers.record_failure(&source.id);
            let outcome = match err {
                FetchError::Timeout(_) => AttemptOutcome::Timeout,
                _ => AttemptOutcome::HttpError,
            };
            self.emit(source, outcome, latency_ms);
            if let FetchError::Http { status, .. } = &err {
                last_status = *status;
            }
            tracing::warn!(
                target: "fetch",
                source = %source.id,
                attempt = attempts,
                error = %err,
                "fetch attempt failed"
            );

            let retry = retry::is_retryable(&err);
            last_err = Some(err);
            if !retry || attempts >= self.backoff.max_attempts {
                break;
            }
            let delay = self.backoff.delay(attempts - 1);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                tracing::debug!(target: "fetch", source = %source.id, "retry would cross the cycle deadline");
                break;
            }
            tokio::time::sleep(delay).await;
        }

        let err = last_err.unwrap_or(FetchError::DeadlineExceeded);
        RawFetchResult::failed(&source.id, err, started, attempts, last_status)
    }

    /// Fetch `sources` with at most `max_concurrency` in flight. Results come
    /// back in completion order.
    pub fn fetch_all<'a>(
        &'a self,
        sources: &'a [Source],
        max_concurrency: usize,
        deadline: Option<Instant>,
    ) -> impl Stream<Item = RawFetchResult> + 'a {
        stream::iter(sources)
            .map(move |s| self.fetch(s, deadline))
            .buffer_unordered(max_concurrency.max(1))
    }
}
