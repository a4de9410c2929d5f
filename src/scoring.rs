// src/scoring.rs
//! Quality scoring.
//!
//! `RuleScorer` is a weighted sum of five signals in [0,1], divided by the sum
//! of the weights and clamped. Other scorers plug in through `Scorer`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::config::ScoreWeights;
use crate::reputation::SourceReputation;
use crate::types::{Configuration, Protocol, Source};

/// Cycle-level context a scorer may use besides the config itself.
#[derive(Debug, Clone, Default)]
pub struct ScoreSignals {
    /// Source tier prior × source weight, in [0,1].
    pub source_prior: f32,
    /// Share of this config's protocol among all survivors of the cycle.
    pub protocol_share: f32,
    /// Fraction of measured sources that are slower than this one. `None`
    /// when the source has no latency samples yet.
    pub latency_percentile: Option<f32>,
}

pub trait Scorer: Send + Sync {
    /// Pure: the same inputs always give the same score, in [0,1].
    fn score(&self, cfg: &Configuration, rep: &SourceReputation, signals: &ScoreSignals) -> f32;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleScorer {
    weights: ScoreWeights,
}

impl RuleScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }
}

impl Scorer for RuleScorer {
    fn score(&self, cfg: &Configuration, rep: &SourceReputation, s: &ScoreSignals) -> f32 {
        let w = &self.weights;
        let raw = s.source_prior.clamp(0.0, 1.0) * w.w_tier
            + rep.state.trust() * w.w_reputation
            + security_strength(cfg) * w.w_security
            + (1.0 - s.protocol_share.clamp(0.0, 1.0)) * w.w_diversity
            + s.latency_percentile.unwrap_or(0.5).clamp(0.0, 1.0) * w.w_latency;

        let denom = (w.w_tier + w.w_reputation + w.w_security + w.w_diversity + w.w_latency).max(1e-6);
        (raw / denom).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "rule"
    }
}

fn is_aead(cipher: &str) -> bool {
    cipher.contains("gcm") || cipher.contains("poly1305")
}

/// Transport security strength in [0,1].
pub fn security_strength(cfg: &Configuration) -> f32 {
    let sec = cfg.security.security.as_deref().unwrap_or("none");
    let base = match cfg.protocol {
        Protocol::Vless | Protocol::Vmess | Protocol::Trojan => match sec {
            "reality" => 1.0,
            "tls" | "xtls" => 0.85,
            _ if cfg.protocol == Protocol::Trojan => 0.5,
            _ => 0.3,
        },
        Protocol::Hysteria | Protocol::Hysteria2 | Protocol::Tuic => 0.8,
        Protocol::Wireguard => 0.9,
        Protocol::Shadowsocks => match cfg.security.encryption.as_deref() {
            Some(c) if c.starts_with("2022-") => 0.8,
            Some(c) if is_aead(c) => 0.7,
            _ => 0.2,
        },
        Protocol::Shadowsocksr => 0.3,
    };
    if cfg.security.insecure {
        base * 0.5
    } else {
        base
    }
}

/// `tier.prior() × weight`, capped to [0,1].
pub fn source_prior(source: &Source) -> f32 {
    (source.tier.prior() * source.weight.max(0.0)).clamp(0.0, 1.0)
}

/// Share of each protocol in `configs`.
pub fn protocol_shares(configs: &[Configuration]) -> HashMap<Protocol, f32> {
    let mut counts: HashMap<Protocol, usize> = HashMap::new();
    for c in configs {
        *counts.entry(c.protocol).or_default() += 1;
    }
    let total = configs.len().max(1) as f32;
    counts.into_iter().map(|(p, n)| (p, n as f32 / total)).collect()
}

/// Latency percentile per source: 1.0 for the fastest, 0.0 for the slowest.
pub fn latency_percentiles(reps: &BTreeMap<String, SourceReputation>) -> HashMap<String, f32> {
    let mut medians: Vec<(&str, u64)> = reps
        .values()
        .filter_map(|r| r.median_latency_ms().map(|m| (r.source_id.as_str(), m)))
        .collect();
    medians.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)));
    let n = medians.len();
    medians
        .iter()
        .enumerate()
        .map(|(i, (id, _))| {
            let pct = if n <= 1 { 1.0 } else { 1.0 - i as f32 / (n - 1) as f32 };
            (id.to_string(), pct)
        })
        .collect()
}

/// Ranking order: score desc, `first_seen_at` asc, canonical key asc.
pub fn rank_order(a: &Configuration, b: &Configuration) -> Ordering {
    let sa = a.quality_score.unwrap_or(0.0);
    let sb = b.quality_score.unwrap_or(0.0);
    sb.total_cmp(&sa)
        .then(a.first_seen_at.cmp(&b.first_seen_at))
        .then(a.canonical_key.cmp(&b.canonical_key))
}
