// src/config/settings.rs
//! Runtime settings for the aggregator.
//!
//! TOML shape (every key optional):
//! ```toml
//! [fetch]
//! timeout_secs = 30
//! max_concurrency = 32
//!
//! [rate_limit]
//! window_secs = 60
//! max_requests_per_window = 6
//! burst = 10
//!
//! [reputation]
//! trusted_after_successes = 3
//! suspend_after_failures = 3
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::SourceTier;

const ENV_PATH: &str = "AGGREGATOR_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub fetch: FetchSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    pub breaker: BreakerSettings,
    pub reputation: ReputationSettings,
    pub cache: CacheSettings,
    pub dedup: DedupSettings,
    pub screening: ScreeningSettings,
    pub scoring: ScoreWeights,
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_secs: u64,
    pub max_concurrency: usize,
    pub max_body_bytes: usize,
    /// Whole-cycle budget; 0 disables the deadline.
    pub cycle_deadline_secs: u64,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_concurrency: 32,
            max_body_bytes: 8 * 1024 * 1024,
            cycle_deadline_secs: 600,
            user_agent: format!("vpn-config-aggregator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cycle_deadline(&self) -> Option<Duration> {
        (self.cycle_deadline_secs > 0).then(|| Duration::from_secs(self.cycle_deadline_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    /// Steady rate: this many requests per window.
    pub max_requests_per_window: u32,
    /// Burst size: requests that may go out back to back.
    pub burst: u32,
    /// How long a limited request may queue for its turn; 0 rejects at once.
    pub max_queue_wait_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests_per_window: 6,
            burst: 10,
            max_queue_wait_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationSettings {
    pub trusted_after_successes: u32,
    pub suspend_after_failures: u32,
    pub cooldown_secs: i64,
    /// Security-rejected share of one fetch above which a source is quarantined.
    pub quarantine_rejection_ratio: f32,
    pub quarantine_min_rejections: u32,
    pub state_path: PathBuf,
}

impl Default for ReputationSettings {
    fn default() -> Self {
        Self {
            trusted_after_successes: 3,
            suspend_after_failures: 3,
            cooldown_secs: 3_600,
            quarantine_rejection_ratio: 0.5,
            quarantine_min_rejections: 1,
            state_path: PathBuf::from("state/reputation.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub memory_capacity: usize,
    /// `None` disables the disk tier.
    pub disk_dir: Option<PathBuf>,
    pub disk_max_entries: usize,
    pub ttl_premium_secs: u64,
    pub ttl_reliable_secs: u64,
    pub ttl_bulk_secs: u64,
    pub ttl_experimental_secs: u64,
    pub last_cycle_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_capacity: 2_048,
            disk_dir: Some(PathBuf::from("cache/aggregator")),
            disk_max_entries: 20_000,
            ttl_premium_secs: 15 * 60,
            ttl_reliable_secs: 30 * 60,
            ttl_bulk_secs: 60 * 60,
            ttl_experimental_secs: 2 * 60 * 60,
            last_cycle_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl CacheSettings {
    /// Premium sources refresh most often, experimental ones least.
    pub fn ttl_for(&self, tier: SourceTier) -> Duration {
        let secs = match tier {
            SourceTier::Premium => self.ttl_premium_secs,
            SourceTier::Reliable => self.ttl_reliable_secs,
            SourceTier::Bulk => self.ttl_bulk_secs,
            SourceTier::Experimental => self.ttl_experimental_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub expected_items: usize,
    pub false_positive_rate: f64,
    pub filter_path: PathBuf,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            expected_items: 1_000_000,
            false_positive_rate: 0.01,
            filter_path: PathBuf::from("state/dedup_filter.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningSettings {
    /// Suffixes like ".tk"; matched against the parsed host.
    pub suspicious_tlds: Vec<String>,
    /// Exact hosts or parent domains that are never accepted.
    pub blocked_hosts: Vec<String>,
    pub reject_local_hosts: bool,
    pub max_line_len: usize,
}

impl Default for ScreeningSettings {
    fn default() -> Self {
        Self {
            suspicious_tlds: vec![".zip".into(), ".mov".into(), ".onion".into()],
            blocked_hosts: Vec::new(),
            reject_local_hosts: true,
            max_line_len: 8_192,
        }
    }
}

/// Signal weights for the rule-based scorer. Normalized by their sum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub w_tier: f32,
    pub w_reputation: f32,
    pub w_security: f32,
    pub w_diversity: f32,
    pub w_latency: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            w_tier: 0.20,
            w_reputation: 0.25,
            w_security: 0.30,
            w_diversity: 0.10,
            w_latency: 0.15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Truncate the ranked set; 0 keeps everything.
    pub max_results: usize,
}

impl AggregatorSettings {
    /// Reject settings that would make a cycle misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.fetch.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be > 0");
        }
        if self.fetch.max_concurrency == 0 {
            bail!("fetch.max_concurrency must be > 0");
        }
        if self.fetch.max_body_bytes == 0 {
            bail!("fetch.max_body_bytes must be > 0");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be > 0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.rate_limit.window_secs == 0 || self.rate_limit.max_requests_per_window == 0 {
            bail!("rate_limit.window_secs and max_requests_per_window must be > 0");
        }
        if self.rate_limit.burst == 0 {
            bail!("rate_limit.burst must be > 0");
        }
        if self.breaker.failure_threshold == 0 {
            bail!("breaker.failure_threshold must be > 0");
        }
        if self.reputation.trusted_after_successes == 0 || self.reputation.suspend_after_failures == 0
        {
            bail!("reputation thresholds must be > 0");
        }
        if !(0.0..=1.0).contains(&self.reputation.quarantine_rejection_ratio) {
            bail!("reputation.quarantine_rejection_ratio must be within 0..=1");
        }
        if self.cache.memory_capacity == 0 {
            bail!("cache.memory_capacity must be > 0");
        }
        let fp = self.dedup.false_positive_rate;
        if !(fp > 0.0 && fp < 1.0) {
            bail!("dedup.false_positive_rate must be within (0, 1)");
        }
        if self.dedup.expected_items == 0 {
            bail!("dedup.expected_items must be > 0");
        }
        Ok(())
    }

    /// Load from an explicit path. TOML or JSON by extension.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let settings: AggregatorSettings = if ext == "json" {
            serde_json::from_str(&content).context("parsing settings json")?
        } else {
            toml::from_str(&content).context("parsing settings toml")?
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings using env var + fallbacks:
    /// 1) $AGGREGATOR_CONFIG_PATH
    /// 2) config/aggregator.toml
    /// 3) config/aggregator.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
        for candidate in ["config/aggregator.toml", "config/aggregator.json"] {
            let p = PathBuf::from(candidate);
            if p.exists() {
                return Self::load_from(&p);
            }
        }
        let settings = Self::default();
        settings.validate()?;
        Ok(settings)
    }
}
