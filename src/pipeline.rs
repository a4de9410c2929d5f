// src/pipeline.rs
//! One aggregation cycle end to end:
//! schedule → configs cache → fetch → decode → parse → reputation feedback →
//! first-seen carry-forward → dedup → score → rank → persist.
//!
//! Cycles are serialized by an async mutex that also owns the deduplicator.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::cache::{body_key, configs_key, CacheScope, DistributedBackend, MultiTierCache, LAST_CYCLE_KEY};
use crate::config::AggregatorSettings;
use crate::decode::decode;
use crate::dedup::{DedupStats, Deduplicator};
use crate::error::{ErrorKind, FetchError};
use crate::fetch::{Fetcher, HttpClient, RawFetchResult, ReqwestClient};
use crate::metrics::ensure_metrics_described;
use crate::parse::{ParseReport, Parser};
use crate::reputation::{
    CycleOutcome, FailureReason, ReputationBook, ReputationManager, ReputationState, SourceReputation,
};
use crate::scoring::{latency_percentiles, protocol_shares, rank_order, source_prior, RuleScorer, ScoreSignals, Scorer};
use crate::types::{Configuration, Source, SourceSet, SourceTier};

/// How one source ended this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Fetched,
    BodyCached,
    ConfigsCached,
    FetchFailed,
    DecodeFailed,
    Empty,
    Rejected,
    DeadlineSkipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceCycleReport {
    pub status: SourceStatus,
    pub configurations: usize,
    pub lines: usize,
    pub security_rejected: usize,
    pub attempts: u32,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceCycleReport {
    fn new(status: SourceStatus) -> Self {
        Self {
            status,
            configurations: 0,
            lines: 0,
            security_rejected: 0,
            attempts: 0,
            latency_ms: 0,
            http_status: None,
            error: None,
        }
    }
}

/// Counters for one cycle. Everything recoverable surfaces here.
#[derive(Debug, Clone, Serialize)]
pub struct CycleStats {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources_total: usize,
    pub sources_scheduled: usize,
    /// Suspended or quarantined, not fetched.
    pub sources_skipped: usize,
    pub sources_fetched: usize,
    pub sources_body_cached: usize,
    pub sources_configs_cached: usize,
    pub sources_failed: usize,
    pub deadline_skipped: usize,
    pub errors: BTreeMap<ErrorKind, usize>,
    pub lines_total: usize,
    pub parsed: usize,
    pub unexpected_protocol: usize,
    pub dropped_quarantined: usize,
    pub duplicates: usize,
    pub new_keys: usize,
    pub returning_keys: usize,
    pub published: usize,
    pub truncated: usize,
    pub added: usize,
    pub removed: usize,
    pub per_protocol: BTreeMap<String, usize>,
    pub per_source: BTreeMap<String, SourceCycleReport>,
}

impl CycleStats {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            sources_total: 0,
            sources_scheduled: 0,
            sources_skipped: 0,
            sources_fetched: 0,
            sources_body_cached: 0,
            sources_configs_cached: 0,
            sources_failed: 0,
            deadline_skipped: 0,
            errors: BTreeMap::new(),
            lines_total: 0,
            parsed: 0,
            unexpected_protocol: 0,
            dropped_quarantined: 0,
            duplicates: 0,
            new_keys: 0,
            returning_keys: 0,
            published: 0,
            truncated: 0,
            added: 0,
            removed: 0,
            per_protocol: BTreeMap::new(),
            per_source: BTreeMap::new(),
        }
    }

    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.errors.get(&kind).copied().unwrap_or(0)
    }

    fn bump(&mut self, kind: ErrorKind, n: usize) {
        if n > 0 {
            *self.errors.entry(kind).or_default() += n;
        }
    }

    fn absorb_parse(&mut self, r: &ParseReport) {
        self.lines_total += r.total;
        self.parsed += r.accepted;
        self.unexpected_protocol += r.unexpected_protocol;
        self.bump(ErrorKind::ParseMalformed, r.malformed_total());
        self.bump(ErrorKind::ParseSecurityRejected, r.security_rejected);
    }

    fn absorb_dedup(&mut self, d: DedupStats) {
        self.duplicates = d.duplicates;
        self.new_keys = d.new_keys;
        self.returning_keys = d.returning_keys;
    }
}

#[derive(Debug, Clone)]
pub struct AggregationResult {
    /// Ranked: score desc, first seen asc, canonical key asc.
    pub configurations: Vec<Configuration>,
    pub stats: CycleStats,
}

struct CycleState {
    dedup: Deduplicator,
}

pub struct AggregatorBuilder {
    settings: AggregatorSettings,
    http: Option<Arc<dyn HttpClient>>,
    distributed: Option<Arc<dyn DistributedBackend>>,
    scorer: Option<Arc<dyn Scorer>>,
    persist: bool,
}

impl AggregatorBuilder {
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    pub fn with_distributed_cache(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.distributed = Some(backend);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Keep reputation and the dedup filter in memory only; nothing is read
    /// from or written to the state paths.
    pub fn ephemeral(mut self) -> Self {
        self.persist = false;
        self
    }

    /// Validate settings, restore persisted state, start the reputation
    /// consumer. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<Aggregator> {
        self.settings.validate()?;
        ensure_metrics_described();
        let settings = Arc::new(self.settings);

        let (book, dedup) = if self.persist {
            (
                ReputationBook::load(settings.reputation.clone(), &settings.reputation.state_path)?,
                Deduplicator::load(&settings.dedup)?,
            )
        } else {
            (
                ReputationBook::new(settings.reputation.clone()),
                Deduplicator::new(&settings.dedup),
            )
        };
        let reputation = ReputationManager::spawn(book);

        let cache = Arc::new(MultiTierCache::from_settings(&settings.cache, self.distributed));
        let http: Arc<dyn HttpClient> = match self.http {
            Some(c) => c,
            None => Arc::new(ReqwestClient::new(&settings.fetch)?),
        };
        let fetcher = Fetcher::new(http, Arc::clone(&cache), Arc::clone(&settings), Some(reputation.handle()));
        let scorer = self
            .scorer
            .unwrap_or_else(|| Arc::new(RuleScorer::new(settings.scoring)) as Arc<dyn Scorer>);

        tracing::info!(
            target: "pipeline",
            scorer = scorer.name(),
            distributed_cache = cache.has_distributed(),
            persist = self.persist,
            "aggregator ready"
        );

        Ok(Aggregator {
            parser: Parser::from_settings(&settings.screening),
            settings,
            cache,
            fetcher,
            reputation,
            scorer,
            persist: self.persist,
            cycle: AsyncMutex::new(CycleState { dedup }),
        })
    }
}

pub struct Aggregator {
    settings: Arc<AggregatorSettings>,
    cache: Arc<MultiTierCache>,
    fetcher: Fetcher,
    parser: Parser,
    reputation: ReputationManager,
    scorer: Arc<dyn Scorer>,
    persist: bool,
    cycle: AsyncMutex<CycleState>,
}

impl Aggregator {
    pub fn builder(settings: AggregatorSettings) -> AggregatorBuilder {
        AggregatorBuilder {
            settings,
            http: None,
            distributed: None,
            scorer: None,
            persist: true,
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    pub fn reputation_snapshot(&self, source_id: &str) -> Option<SourceReputation> {
        self.reputation.snapshot(source_id)
    }

    /// Put a source back to `New`, including out of quarantine. Its cached
    /// body and parsed set are dropped so the next cycle fetches it afresh.
    pub async fn reset_reputation(&self, source_id: &str) -> bool {
        self.reputation.flush().await;
        let existed = self.reputation.reset(source_id);
        self.cache
            .invalidate_scope(&CacheScope::Source(source_id.to_string()))
            .await;
        tracing::info!(target: "pipeline", source = %source_id, existed, "reputation reset");
        existed
    }

    pub async fn invalidate_cache(&self, scope: CacheScope) {
        self.cache.invalidate_scope(&scope).await;
    }

    /// Run one cycle over `set`. Never fails: per-source problems end up in
    /// `CycleStats`, persistence problems are logged.
    pub async fn run_cycle(&self, set: &SourceSet) -> AggregationResult {
        let mut state = self.cycle.lock().await;
        let started = Instant::now();
        let now = Utc::now();
        let mut stats = CycleStats::new(now);
        stats.sources_total = set.len();
        // Only tier errors raised by this cycle are reported with it.
        let _ = self.cache.take_degraded();

        self.reputation.refresh(now);
        let scheduled = self.reputation.schedule(set);
        stats.sources_scheduled = scheduled.len();
        stats.sources_skipped = set.len() - scheduled.len();
        {
            let scheduled_ids: HashSet<&str> = scheduled.iter().map(|s| s.id.as_str()).collect();
            for s in set.sources.iter().filter(|s| !scheduled_ids.contains(s.id.as_str())) {
                tracing::debug!(target: "pipeline", source = %s.id, "source skipped by reputation");
            }
        }

        // Sources whose parsed set is still fresh skip fetch, decode and parse.
        let mut collected: Vec<Configuration> = Vec::new();
        let mut to_fetch: Vec<Source> = Vec::with_capacity(scheduled.len());
        for s in scheduled {
            match self.cache.get_json::<Vec<Configuration>>(&configs_key(&s.id)).await {
                Some(cfgs) => {
                    stats.sources_configs_cached += 1;
                    let mut report = SourceCycleReport::new(SourceStatus::ConfigsCached);
                    report.configurations = cfgs.len();
                    stats.per_source.insert(s.id.clone(), report);
                    collected.extend(cfgs);
                }
                None => to_fetch.push(s),
            }
        }

        let deadline = self.settings.fetch.cycle_deadline().map(|d| Instant::now() + d);
        let by_id: HashMap<&str, &Source> = to_fetch.iter().map(|s| (s.id.as_str(), s)).collect();
        {
            let mut results = self
                .fetcher
                .fetch_all(&to_fetch, self.settings.fetch.max_concurrency, deadline);
            while let Some(raw) = results.next().await {
                let Some(source) = by_id.get(raw.source_id.as_str()) else {
                    continue;
                };
                if let Some(cfgs) = self.process_fetched(source, raw, &mut stats).await {
                    collected.extend(cfgs);
                }
            }
        }

        // Everything this cycle reported must be applied before we look at states.
        self.reputation.flush().await;
        let reps = self.reputation.snapshot_all();
        let before = collected.len();
        collected.retain(|c| {
            reps.get(&c.source_id)
                .map(|r| r.state != ReputationState::Quarantined)
                .unwrap_or(true)
        });
        stats.dropped_quarantined = before - collected.len();

        // Returning keys keep the first-seen time of their first appearance.
        let last: HashMap<String, DateTime<Utc>> =
            self.cache.get_json(LAST_CYCLE_KEY).await.unwrap_or_default();
        for c in collected.iter_mut() {
            if let Some(first) = last.get(&c.compute_canonical_key().0) {
                if *first < c.first_seen_at {
                    c.first_seen_at = *first;
                }
            }
        }
        collected.sort_by(|a, b| a.source_id.cmp(&b.source_id).then(a.raw_uri.cmp(&b.raw_uri)));

        let tier_of: HashMap<String, SourceTier> =
            set.sources.iter().map(|s| (s.id.clone(), s.tier)).collect();
        let mut survivors: Vec<Configuration> = state.dedup.dedupe(collected, &tier_of).collect();
        stats.absorb_dedup(state.dedup.stats());

        self.score(&mut survivors, set, &reps);
        survivors.sort_by(rank_order);
        let limit = self.settings.output.max_results;
        if limit > 0 && survivors.len() > limit {
            stats.truncated = survivors.len() - limit;
            survivors.truncate(limit);
        }

        let published: HashMap<String, DateTime<Utc>> = survivors
            .iter()
            .filter_map(|c| c.canonical_key.as_ref().map(|k| (k.0.clone(), c.first_seen_at)))
            .collect();
        stats.added = published.keys().filter(|k| !last.contains_key(*k)).count();
        stats.removed = last.keys().filter(|k| !published.contains_key(*k)).count();
        self.cache
            .set_json(
                LAST_CYCLE_KEY,
                &published,
                Duration::from_secs(self.settings.cache.last_cycle_ttl_secs),
            )
            .await;

        for c in &survivors {
            *stats.per_protocol.entry(c.protocol.as_str().to_string()).or_default() += 1;
        }
        stats.published = survivors.len();

        if self.persist {
            if let Err(e) = self.reputation.save(&self.settings.reputation.state_path) {
                tracing::warn!(target: "pipeline", error = ?e, "persisting reputation failed");
            }
            if let Err(e) = state.dedup.save() {
                tracing::warn!(target: "pipeline", error = ?e, "persisting dedup filter failed");
            }
        }
        self.cache.flush().await;
        stats.bump(ErrorKind::CacheUnavailable, self.cache.take_degraded());

        stats.finished_at = Utc::now();
        stats.duration_ms = started.elapsed().as_millis() as u64;
        counter!("aggregator_cycles_total").increment(1);
        histogram!("aggregator_cycle_duration_seconds").record(started.elapsed().as_secs_f64());
        gauge!("aggregator_published_configs").set(stats.published as f64);
        gauge!("aggregator_last_cycle_ts").set(stats.finished_at.timestamp() as f64);

        tracing::info!(
            target: "pipeline",
            cycle = %stats.cycle_id,
            sources = stats.sources_scheduled,
            skipped = stats.sources_skipped,
            failed = stats.sources_failed,
            parsed = stats.parsed,
            duplicates = stats.duplicates,
            published = stats.published,
            added = stats.added,
            removed = stats.removed,
            duration_ms = stats.duration_ms,
            "cycle finished"
        );

        AggregationResult {
            configurations: survivors,
            stats,
        }
    }

    /// Decode, parse and report one fetch result. Returns the accepted
    /// configurations of the source, if any.
    async fn process_fetched(
        &self,
        source: &Source,
        raw: RawFetchResult,
        stats: &mut CycleStats,
    ) -> Option<Vec<Configuration>> {
        let events = self.reputation.handle();
        let mut report = SourceCycleReport::new(SourceStatus::Fetched);
        report.attempts = raw.attempts;
        report.latency_ms = raw.latency_ms;
        report.http_status = raw.http_status;

        let body = match raw.result {
            Ok(body) => body,
            Err(e) => {
                if let Some(kind) = e.kind() {
                    stats.bump(kind, 1);
                    if e.counts_against_source() {
                        events.cycle(
                            &source.id,
                            CycleOutcome::Failure {
                                reason: FailureReason::Fetch(kind),
                                total_lines: 0,
                                security_rejected: 0,
                            },
                        );
                    }
                }
                if e == FetchError::DeadlineExceeded {
                    stats.deadline_skipped += 1;
                    report.status = SourceStatus::DeadlineSkipped;
                } else {
                    stats.sources_failed += 1;
                    report.status = SourceStatus::FetchFailed;
                }
                tracing::warn!(target: "pipeline", source = %source.id, error = %e, "source fetch failed");
                report.error = Some(e.to_string());
                stats.per_source.insert(source.id.clone(), report);
                return None;
            }
        };

        if raw.from_cache {
            stats.sources_body_cached += 1;
            report.status = SourceStatus::BodyCached;
        } else {
            stats.sources_fetched += 1;
        }

        let decoded = match decode(&body, source.encoding, self.settings.fetch.max_body_bytes) {
            Ok(d) => d,
            Err(e) => {
                stats.bump(ErrorKind::DecodeFailure, 1);
                stats.sources_failed += 1;
                counter!("aggregator_decode_failures_total").increment(1);
                tracing::warn!(target: "pipeline", source = %source.id, error = %e, "body could not be decoded");
                if !raw.from_cache {
                    events.cycle(
                        &source.id,
                        CycleOutcome::Failure {
                            reason: FailureReason::Decode,
                            total_lines: 0,
                            security_rejected: 0,
                        },
                    );
                }
                self.cache.evict_in_background(&body_key(&source.id));
                report.status = SourceStatus::DecodeFailed;
                report.error = Some(e.to_string());
                stats.per_source.insert(source.id.clone(), report);
                return None;
            }
        };

        let (cfgs, parsed) = self.parser.parse_lines(
            decoded.lines(),
            &source.id,
            &source.expected_protocols,
            Utc::now(),
        );
        stats.absorb_parse(&parsed);
        counter!("aggregator_parse_lines_total", "result" => "accepted").increment(parsed.accepted as u64);
        counter!("aggregator_parse_lines_total", "result" => "malformed")
            .increment(parsed.malformed_total() as u64);
        counter!("aggregator_parse_lines_total", "result" => "security_rejected")
            .increment(parsed.security_rejected as u64);
        if parsed.unexpected_protocol > 0 {
            tracing::debug!(
                target: "pipeline",
                source = %source.id,
                count = parsed.unexpected_protocol,
                "source published protocols it does not declare"
            );
        }

        report.lines = parsed.total;
        report.security_rejected = parsed.security_rejected;
        report.configurations = cfgs.len();

        let outcome = if parsed.accepted == 0 && parsed.security_rejected > 0 {
            report.status = SourceStatus::Rejected;
            CycleOutcome::Failure {
                reason: FailureReason::OnlyRejected,
                total_lines: parsed.total,
                security_rejected: parsed.security_rejected,
            }
        } else if parsed.accepted == 0 {
            report.status = SourceStatus::Empty;
            CycleOutcome::Failure {
                reason: FailureReason::Empty,
                total_lines: parsed.total,
                security_rejected: 0,
            }
        } else {
            CycleOutcome::Success {
                total_lines: parsed.total,
                security_rejected: parsed.security_rejected,
            }
        };
        let clean = matches!(outcome, CycleOutcome::Success { security_rejected: 0, .. });
        // A cached body was already judged when it was fetched.
        if !raw.from_cache {
            events.cycle(&source.id, outcome);
        }
        if !clean {
            self.cache.evict_in_background(&body_key(&source.id));
        }
        stats.per_source.insert(source.id.clone(), report);

        if cfgs.is_empty() {
            return None;
        }
        if clean {
            self.cache
                .set_json(&configs_key(&source.id), &cfgs, self.settings.cache.ttl_for(source.tier))
                .await;
        }
        Some(cfgs)
    }

    fn score(&self, survivors: &mut [Configuration], set: &SourceSet, reps: &BTreeMap<String, SourceReputation>) {
        let shares = protocol_shares(survivors);
        let percentiles = latency_percentiles(reps);
        for c in survivors.iter_mut() {
            let rep = reps
                .get(&c.source_id)
                .cloned()
                .unwrap_or_else(|| SourceReputation::new(c.source_id.clone()));
            let signals = ScoreSignals {
                source_prior: set.get(&c.source_id).map(source_prior).unwrap_or(0.0),
                protocol_share: shares.get(&c.protocol).copied().unwrap_or(0.0),
                latency_percentile: percentiles.get(&c.source_id).copied(),
            };
            c.quality_score = Some(self.scorer.score(c, &rep, &signals));
        }
    }
}
