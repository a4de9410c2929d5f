// src/reputation.rs
//! Per-source trust state machine.
//!
//! ```text
//! New ──first attempt──▶ Probation ──N clean successes──▶ Trusted
//!                           ▲                                │ M failures
//!                           └────────cooldown──────── Suspended ◀┘
//! any ──security ratio over threshold──▶ Quarantined (only `reset` leaves)
//! ```
//!
//! Outcome events arrive over an unbounded channel and are applied by one
//! consumer task. Readers get cloned snapshots.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ReputationSettings;
use crate::error::ErrorKind;
use crate::persist::{read_json, write_json_atomic};
use crate::types::{Source, SourceSet};

const LATENCY_WINDOW: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReputationState {
    New,
    Probation,
    Trusted,
    Suspended,
    Quarantined,
}

impl ReputationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReputationState::New => "new",
            ReputationState::Probation => "probation",
            ReputationState::Trusted => "trusted",
            ReputationState::Suspended => "suspended",
            ReputationState::Quarantined => "quarantined",
        }
    }

    /// Trust in [0,1] fed to the scorer.
    pub fn trust(&self) -> f32 {
        match self {
            ReputationState::Trusted => 1.0,
            ReputationState::Probation => 0.6,
            ReputationState::New => 0.4,
            ReputationState::Suspended => 0.15,
            ReputationState::Quarantined => 0.0,
        }
    }

    fn schedule_rank(&self) -> u8 {
        match self {
            ReputationState::Trusted => 0,
            ReputationState::Probation => 1,
            ReputationState::New => 2,
            ReputationState::Suspended => 3,
            ReputationState::Quarantined => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReputation {
    pub source_id: String,
    pub state: ReputationState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_latency_ms: Option<u64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    #[serde(default)]
    pub suspended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quarantined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latency_samples_ms: VecDeque<u64>,
    #[serde(default)]
    pub total_fetches: u64,
    #[serde(default)]
    pub total_security_rejections: u64,
}

impl SourceReputation {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            state: ReputationState::New,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_latency_ms: None,
            last_success_at: None,
            last_failure_reason: None,
            suspended_at: None,
            quarantined_at: None,
            latency_samples_ms: VecDeque::new(),
            total_fetches: 0,
            total_security_rejections: 0,
        }
    }

    /// Median of the recent latency window.
    pub fn median_latency_ms(&self) -> Option<u64> {
        if self.latency_samples_ms.is_empty() {
            return None;
        }
        let mut v: Vec<u64> = self.latency_samples_ms.iter().copied().collect();
        v.sort_unstable();
        Some(v[v.len() / 2])
    }

    fn push_latency(&mut self, ms: u64) {
        self.last_latency_ms = Some(ms);
        self.latency_samples_ms.push_back(ms);
        while self.latency_samples_ms.len() > LATENCY_WINDOW {
            self.latency_samples_ms.pop_front();
        }
    }
}

/// Result of a single network attempt, as seen by the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Timeout,
    RateLimited,
    HttpError,
    BreakerOpen,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::RateLimited => "rate_limited",
            AttemptOutcome::HttpError => "http_error",
            AttemptOutcome::BreakerOpen => "breaker_open",
        }
    }

    /// Our own throttling says nothing about the source.
    pub fn is_neutral(&self) -> bool {
        matches!(self, AttemptOutcome::RateLimited | AttemptOutcome::BreakerOpen)
    }
}

/// Why a source's cycle counted as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Fetch(ErrorKind),
    Decode,
    Empty,
    /// Every line that parsed or failed screening was security-rejected.
    OnlyRejected,
}

impl FailureReason {
    pub fn describe(&self) -> String {
        match self {
            FailureReason::Fetch(kind) => kind.as_str().to_string(),
            FailureReason::Decode => ErrorKind::DecodeFailure.as_str().to_string(),
            FailureReason::Empty => "empty_result".to_string(),
            FailureReason::OnlyRejected => "only_security_rejected".to_string(),
        }
    }
}

/// Per-source summary of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success {
        total_lines: usize,
        security_rejected: usize,
    },
    Failure {
        reason: FailureReason,
        total_lines: usize,
        security_rejected: usize,
    },
}

impl CycleOutcome {
    fn lines(&self) -> (usize, usize) {
        match self {
            CycleOutcome::Success {
                total_lines,
                security_rejected,
            }
            | CycleOutcome::Failure {
                total_lines,
                security_rejected,
                ..
            } => (*total_lines, *security_rejected),
        }
    }
}

#[derive(Debug)]
pub enum ReputationEvent {
    Attempt {
        source_id: String,
        outcome: AttemptOutcome,
        latency_ms: u64,
        at: DateTime<Utc>,
    },
    Cycle {
        source_id: String,
        outcome: CycleOutcome,
        at: DateTime<Utc>,
    },
    Flush(oneshot::Sender<()>),
}

/// The reputation table and its transition rules. Pure and synchronous; the
/// manager wraps it for concurrent use.
#[derive(Debug, Clone)]
pub struct ReputationBook {
    settings: ReputationSettings,
    table: BTreeMap<String, SourceReputation>,
}

#[derive(Serialize, Deserialize)]
struct PersistedBook {
    version: u32,
    saved_at: DateTime<Utc>,
    sources: Vec<SourceReputation>,
}

impl ReputationBook {
    pub fn new(settings: ReputationSettings) -> Self {
        Self {
            settings,
            table: BTreeMap::new(),
        }
    }

    fn entry(&mut self, id: &str) -> &mut SourceReputation {
        self.table
            .entry(id.to_string())
            .or_insert_with(|| SourceReputation::new(id))
    }

    pub fn get(&self, id: &str) -> Option<&SourceReputation> {
        self.table.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &SourceReputation> {
        self.table.values()
    }

    pub fn apply_attempt(&mut self, id: &str, outcome: AttemptOutcome, latency_ms: u64, at: DateTime<Utc>) {
        let rep = self.entry(id);
        if outcome.is_neutral() {
            return;
        }
        rep.total_fetches += 1;
        if rep.state == ReputationState::New {
            transition(rep, ReputationState::Probation);
        }
        match outcome {
            AttemptOutcome::Success => {
                rep.push_latency(latency_ms);
                rep.last_success_at = Some(at);
            }
            AttemptOutcome::Timeout => {
                rep.last_failure_reason = Some(ErrorKind::FetchTimeout.as_str().into());
            }
            AttemptOutcome::HttpError => {
                rep.last_failure_reason = Some(ErrorKind::FetchHttpError.as_str().into());
            }
            AttemptOutcome::RateLimited | AttemptOutcome::BreakerOpen => {}
        }
    }

    pub fn apply_cycle(&mut self, id: &str, outcome: &CycleOutcome, at: DateTime<Utc>) {
        let ratio_limit = self.settings.quarantine_rejection_ratio;
        let min_rejections = self.settings.quarantine_min_rejections.max(1) as usize;
        let trusted_after = self.settings.trusted_after_successes;
        let suspend_after = self.settings.suspend_after_failures;

        let rep = self.entry(id);
        if rep.state == ReputationState::Quarantined {
            return;
        }
        if rep.state == ReputationState::New {
            transition(rep, ReputationState::Probation);
        }

        let (total, rejected) = outcome.lines();
        rep.total_security_rejections += rejected as u64;
        if total > 0 && rejected >= min_rejections && rejected as f32 / total as f32 > ratio_limit {
            rep.quarantined_at = Some(at);
            rep.last_failure_reason = Some(ErrorKind::ParseSecurityRejected.as_str().into());
            transition(rep, ReputationState::Quarantined);
            tracing::warn!(
                target: "reputation",
                source = %id,
                rejected,
                total,
                "source quarantined for hostile content"
            );
            return;
        }

        match outcome {
            CycleOutcome::Success { security_rejected, .. } => {
                rep.consecutive_failures = 0;
                // Rejections keep a source out of the clean streak.
                if *security_rejected > 0 {
                    rep.consecutive_successes = 0;
                } else {
                    rep.consecutive_successes += 1;
                }
                if rep.state == ReputationState::Probation && rep.consecutive_successes >= trusted_after {
                    transition(rep, ReputationState::Trusted);
                }
            }
            CycleOutcome::Failure { reason, .. } => {
                rep.consecutive_successes = 0;
                rep.consecutive_failures += 1;
                rep.last_failure_reason = Some(reason.describe());
                if rep.state == ReputationState::Trusted && rep.consecutive_failures >= suspend_after {
                    rep.suspended_at = Some(at);
                    transition(rep, ReputationState::Suspended);
                }
            }
        }
    }

    /// Move suspended sources whose cooldown has elapsed back to probation.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        let cooldown = Duration::seconds(self.settings.cooldown_secs);
        for rep in self.table.values_mut() {
            if rep.state != ReputationState::Suspended {
                continue;
            }
            let elapsed = rep.suspended_at.map(|t| now - t >= cooldown).unwrap_or(true);
            if elapsed {
                rep.consecutive_failures = 0;
                rep.suspended_at = None;
                transition(rep, ReputationState::Probation);
            }
        }
    }

    /// Sources eligible for fetching this cycle, in fetch priority order.
    pub fn schedule(&self, set: &SourceSet) -> Vec<Source> {
        let mut eligible: Vec<(&Source, ReputationState)> = set
            .sources
            .iter()
            .map(|s| {
                let state = self.table.get(&s.id).map(|r| r.state).unwrap_or(ReputationState::New);
                (s, state)
            })
            .filter(|(_, st)| !matches!(st, ReputationState::Suspended | ReputationState::Quarantined))
            .collect();

        eligible.sort_by(|(a, sa), (b, sb)| {
            sa.schedule_rank()
                .cmp(&sb.schedule_rank())
                .then(a.tier.cmp(&b.tier))
                .then(b.weight.total_cmp(&a.weight))
                .then(a.id.cmp(&b.id))
        });
        eligible.into_iter().map(|(s, _)| s.clone()).collect()
    }

    /// Forget everything about one source; it starts over as `New`.
    pub fn reset(&mut self, id: &str) -> bool {
        self.table.remove(id).is_some()
    }

    pub fn load(settings: ReputationSettings, path: &Path) -> Result<Self> {
        let mut book = Self::new(settings);
        if let Some(persisted) = read_json::<PersistedBook>(path)? {
            for rep in persisted.sources {
                book.table.insert(rep.source_id.clone(), rep);
            }
        }
        Ok(book)
    }

    /// Atomic write: tmp file then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let persisted = PersistedBook {
            version: 1,
            saved_at: Utc::now(),
            sources: self.table.values().cloned().collect(),
        };
        write_json_atomic(path, &persisted)
    }
}

fn transition(rep: &mut SourceReputation, to: ReputationState) {
    if rep.state == to {
        return;
    }
    tracing::info!(
        target: "reputation",
        source = %rep.source_id,
        from = rep.state.as_str(),
        to = to.as_str(),
        "reputation transition"
    );
    counter!("aggregator_reputation_transitions_total", "to" => to.as_str()).increment(1);
    rep.state = to;
}

/// Cheap cloneable sender used by the fetcher and the orchestrator.
#[derive(Debug, Clone)]
pub struct ReputationHandle {
    tx: mpsc::UnboundedSender<ReputationEvent>,
}

impl ReputationHandle {
    pub fn attempt(&self, source_id: &str, outcome: AttemptOutcome, latency_ms: u64) {
        self.send(ReputationEvent::Attempt {
            source_id: source_id.to_string(),
            outcome,
            latency_ms,
            at: Utc::now(),
        });
    }

    pub fn cycle(&self, source_id: &str, outcome: CycleOutcome) {
        self.send(ReputationEvent::Cycle {
            source_id: source_id.to_string(),
            outcome,
            at: Utc::now(),
        });
    }

    fn send(&self, ev: ReputationEvent) {
        if self.tx.send(ev).is_err() {
            tracing::warn!(target: "reputation", "reputation consumer is gone; event dropped");
        }
    }
}

/// Owns the book and the single task that mutates it from events.
pub struct ReputationManager {
    book: Arc<Mutex<ReputationBook>>,
    tx: mpsc::UnboundedSender<ReputationEvent>,
    consumer: JoinHandle<()>,
}

impl ReputationManager {
    /// Must be called inside a Tokio runtime.
    pub fn spawn(book: ReputationBook) -> Self {
        let book = Arc::new(Mutex::new(book));
        let (tx, mut rx) = mpsc::unbounded_channel::<ReputationEvent>();
        let shared = Arc::clone(&book);
        let consumer = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                match ev {
                    ReputationEvent::Attempt {
                        source_id,
                        outcome,
                        latency_ms,
                        at,
                    } => shared.lock().apply_attempt(&source_id, outcome, latency_ms, at),
                    ReputationEvent::Cycle { source_id, outcome, at } => {
                        shared.lock().apply_cycle(&source_id, &outcome, at)
                    }
                    ReputationEvent::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { book, tx, consumer }
    }

    pub fn handle(&self) -> ReputationHandle {
        ReputationHandle { tx: self.tx.clone() }
    }

    /// Wait until every event sent before this call has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(ReputationEvent::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn refresh(&self, now: DateTime<Utc>) {
        self.book.lock().refresh(now);
    }

    pub fn schedule(&self, set: &SourceSet) -> Vec<Source> {
        self.book.lock().schedule(set)
    }

    pub fn snapshot(&self, id: &str) -> Option<SourceReputation> {
        self.book.lock().get(id).cloned()
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, SourceReputation> {
        self.book
            .lock()
            .all()
            .map(|r| (r.source_id.clone(), r.clone()))
            .collect()
    }

    pub fn reset(&self, id: &str) -> bool {
        self.book.lock().reset(id)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let book = self.book.lock().clone();
        book.save(path)
    }
}

impl Drop for ReputationManager {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceTier;

    fn book() -> ReputationBook {
        ReputationBook::new(ReputationSettings::default())
    }

    fn ok() -> CycleOutcome {
        CycleOutcome::Success {
            total_lines: 10,
            security_rejected: 0,
        }
    }

    fn fail() -> CycleOutcome {
        CycleOutcome::Failure {
            reason: FailureReason::Fetch(ErrorKind::FetchTimeout),
            total_lines: 0,
            security_rejected: 0,
        }
    }

    fn state(b: &ReputationBook, id: &str) -> ReputationState {
        b.get(id).map(|r| r.state).unwrap_or(ReputationState::New)
    }

    #[test]
    fn first_attempt_moves_new_to_probation() {
        let mut b = book();
        b.apply_attempt("a", AttemptOutcome::RateLimited, 0, Utc::now());
        assert_eq!(state(&b, "a"), ReputationState::New);
        b.apply_attempt("a", AttemptOutcome::Timeout, 30_000, Utc::now());
        assert_eq!(state(&b, "a"), ReputationState::Probation);
    }

    #[test]
    fn clean_streak_promotes_and_failures_suspend_then_cooldown() {
        let mut b = book();
        let t0 = Utc::now();
        for _ in 0..3 {
            b.apply_cycle("a", &ok(), t0);
        }
        assert_eq!(state(&b, "a"), ReputationState::Trusted);

        for _ in 0..2 {
            b.apply_cycle("a", &fail(), t0);
        }
        assert_eq!(state(&b, "a"), ReputationState::Trusted);
        b.apply_cycle("a", &fail(), t0);
        assert_eq!(state(&b, "a"), ReputationState::Suspended);

        b.refresh(t0 + Duration::minutes(30));
        assert_eq!(state(&b, "a"), ReputationState::Suspended);
        b.refresh(t0 + Duration::minutes(61));
        assert_eq!(state(&b, "a"), ReputationState::Probation);
    }

    #[test]
    fn rejections_break_the_clean_streak() {
        let mut b = book();
        let t = Utc::now();
        b.apply_cycle("a", &ok(), t);
        b.apply_cycle("a", &ok(), t);
        b.apply_cycle(
            "a",
            &CycleOutcome::Success {
                total_lines: 10,
                security_rejected: 1,
            },
            t,
        );
        b.apply_cycle("a", &ok(), t);
        assert_eq!(state(&b, "a"), ReputationState::Probation);
    }

    #[test]
    fn hostile_ratio_quarantines_until_reset() {
        let mut b = book();
        let t = Utc::now();
        b.apply_cycle(
            "a",
            &CycleOutcome::Failure {
                reason: FailureReason::OnlyRejected,
                total_lines: 4,
                security_rejected: 3,
            },
            t,
        );
        assert_eq!(state(&b, "a"), ReputationState::Quarantined);
        for _ in 0..5 {
            b.apply_cycle("a", &ok(), t);
        }
        b.refresh(t + Duration::days(30));
        assert_eq!(state(&b, "a"), ReputationState::Quarantined);
        assert!(b.reset("a"));
        assert_eq!(state(&b, "a"), ReputationState::New);
    }

    #[test]
    fn exactly_half_is_not_quarantine() {
        let mut b = book();
        b.apply_cycle(
            "a",
            &CycleOutcome::Success {
                total_lines: 4,
                security_rejected: 2,
            },
            Utc::now(),
        );
        assert_eq!(state(&b, "a"), ReputationState::Probation);
    }

    #[test]
    fn schedule_orders_by_state_tier_weight_id_and_skips_blocked() {
        let src = |id: &str, tier, weight| Source {
            id: id.into(),
            url: format!("https://{id}.example/sub"),
            tier,
            weight,
            expected_protocols: Default::default(),
            encoding: Default::default(),
        };
        let set = SourceSet {
            sources: vec![
                src("n1", SourceTier::Premium, 1.0),
                src("p2", SourceTier::Bulk, 2.0),
                src("p1", SourceTier::Bulk, 3.0),
                src("t1", SourceTier::Experimental, 1.0),
                src("q1", SourceTier::Premium, 9.0),
            ],
        };
        let mut b = book();
        let t = Utc::now();
        for _ in 0..3 {
            b.apply_cycle("t1", &ok(), t);
        }
        b.apply_cycle("p1", &fail(), t);
        b.apply_cycle("p2", &fail(), t);
        b.apply_cycle(
            "q1",
            &CycleOutcome::Failure {
                reason: FailureReason::OnlyRejected,
                total_lines: 1,
                security_rejected: 1,
            },
            t,
        );
        let order: Vec<String> = b.schedule(&set).into_iter().map(|s| s.id).collect();
        assert_eq!(order, vec!["t1", "p1", "p2", "n1"]);
    }

    #[test]
    fn latency_window_is_bounded() {
        let mut b = book();
        for i in 0..100u64 {
            b.apply_attempt("a", AttemptOutcome::Success, i, Utc::now());
        }
        let r = b.get("a").unwrap();
        assert_eq!(r.latency_samples_ms.len(), LATENCY_WINDOW);
        assert_eq!(r.last_latency_ms, Some(99));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/reputation.json");
        let mut b = book();
        b.apply_cycle("a", &fail(), Utc::now());
        b.save(&path).unwrap();
        let back = ReputationBook::load(ReputationSettings::default(), &path).unwrap();
        assert_eq!(back.get("a"), b.get("a"));
    }

    #[tokio::test]
    async fn manager_applies_events_before_flush_returns() {
        let m = ReputationManager::spawn(book());
        let h = m.handle();
        h.attempt("a", AttemptOutcome::Success, 120);
        for _ in 0..3 {
            h.cycle("a", ok());
        }
        m.flush().await;
        let snap = m.snapshot("a").unwrap();
        assert_eq!(snap.state, ReputationState::Trusted);
        assert_eq!(snap.last_latency_ms, Some(120));
    }
}
