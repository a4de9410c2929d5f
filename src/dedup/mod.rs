// src/dedup/mod.rs
//! Deduplication by canonical key.
//!
//! Two structures: an exact map that lives for one cycle and a Bloom filter
//! that persists across cycles. A negative filter answer means the key was
//! never seen, so the exact lookup is skipped. A positive answer only triggers
//! the exact check. The filter alone never drops anything.

pub mod bloom;

use anyhow::Result;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::DedupSettings;
use crate::persist::{read_json, write_json_atomic};
use crate::types::{CanonicalKey, Configuration, SourceTier};

pub use bloom::BloomFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub input: usize,
    pub duplicates: usize,
    /// Keys the filter had never seen.
    pub new_keys: usize,
    /// Keys the filter reports from an earlier cycle (or a false positive).
    pub returning_keys: usize,
}

/// `Less` when `a` should survive over `b`: higher source tier, then earlier
/// `first_seen_at`, then smaller source id.
pub fn survivor_order(a: &Configuration, a_tier: SourceTier, b: &Configuration, b_tier: SourceTier) -> Ordering {
    a_tier
        .cmp(&b_tier)
        .then(a.first_seen_at.cmp(&b.first_seen_at))
        .then(a.source_id.cmp(&b.source_id))
}

pub struct Deduplicator {
    filter: BloomFilter,
    filter_path: Option<PathBuf>,
    exact: HashMap<CanonicalKey, usize>,
    stats: DedupStats,
}

impl Deduplicator {
    pub fn new(settings: &DedupSettings) -> Self {
        Self {
            filter: BloomFilter::new(settings.expected_items, settings.false_positive_rate),
            filter_path: None,
            exact: HashMap::new(),
            stats: DedupStats::default(),
        }
    }

    /// Restore the filter from `settings.filter_path`. A file sized for other
    /// parameters is discarded.
    pub fn load(settings: &DedupSettings) -> Result<Self> {
        let mut d = Self::new(settings);
        d.filter_path = Some(settings.filter_path.clone());
        if let Some(filter) = read_json::<BloomFilter>(&settings.filter_path)? {
            if filter.matches_params(settings.expected_items, settings.false_positive_rate) {
                tracing::info!(
                    target: "dedup",
                    keys = filter.inserted(),
                    "restored dedup filter"
                );
                d.filter = filter;
            } else {
                tracing::warn!(target: "dedup", "dedup filter sizing changed; starting fresh");
            }
        }
        Ok(d)
    }

    pub fn save(&self) -> Result<()> {
        match &self.filter_path {
            Some(path) => write_json_atomic(path, &self.filter),
            None => Ok(()),
        }
    }

    /// Clear per-cycle state. The filter is kept.
    pub fn begin_cycle(&mut self) {
        self.exact.clear();
        self.stats = DedupStats::default();
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    /// Collapse one cycle's configurations. Each survivor gets its
    /// `canonical_key` set. Output keeps first-appearance order of keys.
    pub fn dedupe<I>(
        &mut self,
        configs: I,
        tier_of: &HashMap<String, SourceTier>,
    ) -> std::vec::IntoIter<Configuration>
    where
        I: IntoIterator<Item = Configuration>,
    {
        self.begin_cycle();
        let tier = |c: &Configuration| tier_of.get(&c.source_id).copied().unwrap_or(SourceTier::Experimental);
        let mut kept: Vec<Configuration> = Vec::new();

        for mut cfg in configs {
            self.stats.input += 1;
            let key = cfg.compute_canonical_key();
            cfg.canonical_key = Some(key.clone());

            if !self.filter.contains(&key.0) {
                self.filter.insert(&key.0);
                self.stats.new_keys += 1;
                self.exact.insert(key, kept.len());
                kept.push(cfg);
                continue;
            }

            match self.exact.get(&key) {
                Some(&idx) => {
                    self.stats.duplicates += 1;
                    let current = &kept[idx];
                    if survivor_order(&cfg, tier(&cfg), current, tier(current)) == Ordering::Less {
                        kept[idx] = cfg;
                    }
                }
                None => {
                    self.stats.returning_keys += 1;
                    self.exact.insert(key, kept.len());
                    kept.push(cfg);
                }
            }
        }

        metrics::counter!("aggregator_dedup_duplicates_total").increment(self.stats.duplicates as u64);
        kept.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Protocol, SecurityInfo};
    use chrono::{Duration, Utc};

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn cfg(source: &str, host: &str, age_secs: i64) -> Configuration {
        Configuration {
            protocol: Protocol::Vless,
            host: host.into(),
            port: 443,
            identifier: UUID.into(),
            security: SecurityInfo::default(),
            network: None,
            name: None,
            raw_uri: format!("vless://{UUID}@{host}:443"),
            source_id: source.into(),
            first_seen_at: Utc::now() - Duration::seconds(age_secs),
            quality_score: None,
            canonical_key: None,
        }
    }

    fn tiers() -> HashMap<String, SourceTier> {
        [
            ("prem".to_string(), SourceTier::Premium),
            ("bulk".to_string(), SourceTier::Bulk),
            ("bulk2".to_string(), SourceTier::Bulk),
        ]
        .into_iter()
        .collect()
    }

    fn dd() -> Deduplicator {
        Deduplicator::new(&DedupSettings::default())
    }

    #[test]
    fn higher_tier_wins() {
        let mut d = dd();
        let out: Vec<_> = d
            .dedupe(vec![cfg("bulk", "a.example", 100), cfg("prem", "A.example.", 0)], &tiers())
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source_id, "prem");
        assert!(out[0].canonical_key.is_some());
        assert_eq!(d.stats().duplicates, 1);
    }

    #[test]
    fn same_tier_earlier_first_seen_then_smaller_id() {
        let mut d = dd();
        let out: Vec<_> = d
            .dedupe(vec![cfg("bulk", "a.example", 10), cfg("bulk2", "a.example", 50)], &tiers())
            .collect();
        assert_eq!(out[0].source_id, "bulk2");

        let mut a = cfg("bulk2", "b.example", 0);
        let mut b = cfg("bulk", "b.example", 0);
        b.first_seen_at = a.first_seen_at;
        a.name = Some("x".into());
        let out: Vec<_> = d.dedupe(vec![a, b], &tiers()).collect();
        assert_eq!(out[0].source_id, "bulk");
    }

    #[test]
    fn dedupe_is_idempotent() {
        let mut d = dd();
        let input = vec![
            cfg("bulk", "a.example", 1),
            cfg("prem", "a.example", 2),
            cfg("bulk", "b.example", 3),
        ];
        let once: Vec<_> = d.dedupe(input, &tiers()).collect();
        let twice: Vec<_> = d.dedupe(once.clone(), &tiers()).collect();
        assert_eq!(once, twice);
        assert_eq!(d.stats().duplicates, 0);
    }

    #[test]
    fn returning_keys_are_not_dropped() {
        let mut d = dd();
        let _ = d.dedupe(vec![cfg("bulk", "a.example", 0)], &tiers()).count();
        let out: Vec<_> = d.dedupe(vec![cfg("bulk", "a.example", 0)], &tiers()).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(d.stats().returning_keys, 1);
        assert_eq!(d.stats().new_keys, 0);
    }

    #[test]
    fn filter_persists() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DedupSettings {
            expected_items: 1_000,
            false_positive_rate: 0.01,
            filter_path: dir.path().join("dedup_filter.json"),
        };
        let mut d = Deduplicator::load(&settings).unwrap();
        let _ = d.dedupe(vec![cfg("bulk", "a.example", 0)], &tiers()).count();
        d.save().unwrap();

        let mut d2 = Deduplicator::load(&settings).unwrap();
        let _ = d2.dedupe(vec![cfg("bulk", "a.example", 0)], &tiers()).count();
        assert_eq!(d2.stats().returning_keys, 1);
    }

    #[test]
    fn zero_sized_filter_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DedupSettings {
            expected_items: 1_000,
            false_positive_rate: 0.01,
            filter_path: dir.path().join("dedup_filter.json"),
        };
        std::fs::write(
            &settings.filter_path,
            r#"{"num_bits":0,"num_hashes":0,"expected_items":1000,"false_positive_rate":0.01,"inserted":0,"bits":""}"#,
        )
        .unwrap();
        let mut d = Deduplicator::load(&settings).unwrap();
        let out: Vec<_> = d.dedupe(vec![cfg("bulk", "a.example", 0)], &tiers()).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(d.stats().new_keys, 1);
    }
}
