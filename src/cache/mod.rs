// src/cache/mod.rs
//! Multi-tier cache: memory LRU → optional distributed backend → disk.
//!
//! Reads walk the tiers top-down and promote hits upward with their remaining
//! TTL. Writes land in memory synchronously and are copied to the lower tiers
//! by background tasks; `flush()` waits for those. An unreachable tier is
//! logged and skipped, never surfaced to the caller.

pub mod disk;
pub mod distributed;
pub mod memory;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::config::CacheSettings;
use crate::error::CacheError;

pub use disk::DiskTier;
pub use distributed::{DistributedBackend, InMemoryBackend};
pub use memory::MemoryTier;

/// Key of the last body fetched for a source.
pub fn body_key(source_id: &str) -> String {
    format!("source:{source_id}:body")
}

/// Key of the last parsed configuration set of a source.
pub fn configs_key(source_id: &str) -> String {
    format!("source:{source_id}:configs")
}

/// Key of the canonical-key → first-seen map published by the last cycle.
pub const LAST_CYCLE_KEY: &str = "cycle:last:first_seen";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Memory,
    Distributed,
    Disk,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Memory => "memory",
            CacheTier::Distributed => "distributed",
            CacheTier::Disk => "disk",
        }
    }
}

/// Tier-agnostic envelope. Never mutated in place; promotion builds a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(with = "value_b64")]
    pub value: Vec<u8>,
    pub inserted_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub tier: CacheTier,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Duration, tier: CacheTier) -> Self {
        Self {
            key: key.into(),
            value,
            inserted_at: Utc::now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            tier,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_ms).unwrap_or(i64::MAX);
        chrono::Duration::try_milliseconds(ttl)
            .and_then(|d| self.inserted_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Same entry, same expiry, stored in another tier.
    pub fn in_tier(&self, tier: CacheTier) -> Self {
        Self {
            tier,
            ..self.clone()
        }
    }
}

mod value_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// What `invalidate_scope` removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Key(String),
    Prefix(String),
    /// Everything cached for one source (body and parsed set).
    Source(String),
}

pub struct MultiTierCache {
    memory: Arc<MemoryTier>,
    distributed: Option<Arc<dyn DistributedBackend>>,
    disk: Option<Arc<DiskTier>>,
    pending: Mutex<JoinSet<()>>,
    /// Tier errors since the last `take_degraded`.
    degraded: Arc<AtomicUsize>,
}

impl MultiTierCache {
    pub fn new(
        memory: MemoryTier,
        distributed: Option<Arc<dyn DistributedBackend>>,
        disk: Option<DiskTier>,
    ) -> Self {
        Self {
            memory: Arc::new(memory),
            distributed,
            disk: disk.map(Arc::new),
            pending: Mutex::new(JoinSet::new()),
            degraded: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_settings(
        settings: &CacheSettings,
        distributed: Option<Arc<dyn DistributedBackend>>,
    ) -> Self {
        let disk = settings
            .disk_dir
            .as_ref()
            .map(|dir| DiskTier::new(dir.clone(), settings.disk_max_entries));
        Self::new(MemoryTier::new(settings.memory_capacity), distributed, disk)
    }

    /// Memory-only cache, handy for tests and dry runs.
    pub fn memory_only(capacity: usize) -> Self {
        Self::new(MemoryTier::new(capacity), None, None)
    }

    pub fn has_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Utc::now();

        if let Some(hit) = self.memory.get(key, now) {
            counter!("aggregator_cache_hits_total", "tier" => "memory").increment(1);
            return Some(hit.value);
        }

        if let Some(backend) = &self.distributed {
            match backend.get(key).await {
                Ok(Some(entry)) if !entry.is_expired_at(now) => {
                    counter!("aggregator_cache_hits_total", "tier" => "distributed").increment(1);
                    self.memory.insert(entry.in_tier(CacheTier::Memory));
                    return Some(entry.value);
                }
                Ok(_) => {}
                Err(e) => degrade(&self.degraded, backend.name(), &e),
            }
        }

        if let Some(disk) = &self.disk {
            match disk.get(key, now).await {
                Ok(Some(entry)) => {
                    counter!("aggregator_cache_hits_total", "tier" => "disk").increment(1);
                    self.memory.insert(entry.in_tier(CacheTier::Memory));
                    if let Some(backend) = &self.distributed {
                        let backend = Arc::clone(backend);
                        let degraded = Arc::clone(&self.degraded);
                        let promoted = entry.in_tier(CacheTier::Distributed);
                        self.pending.lock().spawn(async move {
                            if let Err(e) = backend.set(promoted).await {
                                degrade(&degraded, backend.name(), &e);
                            }
                        });
                    }
                    return Some(entry.value);
                }
                Ok(None) => {}
                Err(e) => degrade(&self.degraded, "disk", &e),
            }
        }

        counter!("aggregator_cache_misses_total").increment(1);
        None
    }

    /// Store in memory now and in the lower tiers in the background.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let entry = CacheEntry::new(key, value, ttl, CacheTier::Memory);
        let evicted = self.memory.insert(entry.clone());
        if evicted > 0 {
            counter!("aggregator_cache_evictions_total").increment(evicted as u64);
        }

        let mut pending = self.pending.lock();
        while pending.try_join_next().is_some() {}

        if let Some(backend) = &self.distributed {
            let backend = Arc::clone(backend);
            let degraded = Arc::clone(&self.degraded);
            let e = entry.in_tier(CacheTier::Distributed);
            pending.spawn(async move {
                if let Err(err) = backend.set(e).await {
                    degrade(&degraded, backend.name(), &err);
                }
            });
        }
        if let Some(disk) = &self.disk {
            let disk = Arc::clone(disk);
            let degraded = Arc::clone(&self.degraded);
            let e = entry.in_tier(CacheTier::Disk);
            pending.spawn(async move {
                if let Err(err) = disk.set(&e).await {
                    degrade(&degraded, "disk", &err);
                }
            });
        }
    }

    /// Serialize `value` as JSON and `set` it.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, bytes, ttl).await,
            Err(e) => tracing::warn!(target: "cache", key, error = %e, "cache value not serializable"),
        }
    }

    /// `get` + JSON decode. Undecodable entries are treated as misses.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(target: "cache", key, error = %e, "dropping undecodable cache entry");
                self.evict_in_background(key);
                None
            }
        }
    }

    /// Wait until background writes to lower tiers have finished.
    pub async fn flush(&self) {
        let mut set = std::mem::take(&mut *self.pending.lock());
        while set.join_next().await.is_some() {}
    }

    /// Drop `key` from memory now and from the lower tiers in the background,
    /// after every write already queued. The caller never waits on a tier.
    pub fn evict_in_background(&self, key: &str) {
        self.memory.remove(key);
        if self.distributed.is_none() && self.disk.is_none() {
            return;
        }

        let mut pending = self.pending.lock();
        let mut earlier = std::mem::take(&mut *pending);
        let key = key.to_string();
        let backend = self.distributed.clone();
        let disk = self.disk.clone();
        let degraded = Arc::clone(&self.degraded);
        pending.spawn(async move {
            while earlier.join_next().await.is_some() {}
            if let Some(backend) = backend {
                if let Err(e) = backend.delete(&key).await {
                    degrade(&degraded, backend.name(), &e);
                }
            }
            if let Some(disk) = disk {
                if let Err(e) = disk.remove(&key).await {
                    degrade(&degraded, "disk", &e);
                }
            }
        });
    }

    pub async fn invalidate(&self, key: &str) {
        self.invalidate_scope(&CacheScope::Key(key.to_string())).await;
    }

    pub async fn invalidate_scope(&self, scope: &CacheScope) {
        // Pending writes would otherwise resurrect what we remove.
        self.flush().await;

        let prefix = match scope {
            CacheScope::Key(key) => {
                self.memory.remove(key);
                if let Some(backend) = &self.distributed {
                    if let Err(e) = backend.delete(key).await {
                        degrade(&self.degraded, backend.name(), &e);
                    }
                }
                if let Some(disk) = &self.disk {
                    if let Err(e) = disk.remove(key).await {
                        degrade(&self.degraded, "disk", &e);
                    }
                }
                return;
            }
            CacheScope::All => String::new(),
            CacheScope::Prefix(p) => p.clone(),
            CacheScope::Source(id) => format!("source:{id}:"),
        };

        if prefix.is_empty() {
            self.memory.clear();
        } else {
            self.memory.remove_prefix(&prefix);
        }
        if let Some(backend) = &self.distributed {
            if let Err(e) = backend.delete_prefix(&prefix).await {
                degrade(&self.degraded, backend.name(), &e);
            }
        }
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.remove_prefix(&prefix).await {
                degrade(&self.degraded, "disk", &e);
            }
        }
        tracing::info!(target: "cache", scope = ?scope, "cache invalidated");
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    /// Tier errors since the previous call; the count restarts at zero.
    pub fn take_degraded(&self) -> usize {
        self.degraded.swap(0, Ordering::Relaxed)
    }
}

fn degrade(count: &AtomicUsize, tier: &str, e: &CacheError) {
    count.fetch_add(1, Ordering::Relaxed);
    tracing::warn!(target: "cache", tier, error = %e, kind = e.kind().as_str(), "cache tier degraded");
    counter!("aggregator_cache_unavailable_total", "tier" => tier.to_string()).increment(1);
}
