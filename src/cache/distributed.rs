// src/cache/distributed.rs
//! Tier 2: optional shared cache reached over the network.
//!
//! The crate only defines the contract. Deployments plug in a Redis or
//! memcached client; tests and single-node runs use `InMemoryBackend`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::CacheEntry;
use crate::error::CacheError;

#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Fetch an entry. Expiry is checked by the caller.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Delete every key starting with `prefix` (empty prefix = everything).
    async fn delete_prefix(&self, prefix: &str) -> Result<(), CacheError>;
    fn name(&self) -> &'static str;
}

/// Process-local stand-in for a shared store. Can be switched offline to
/// exercise the `CacheUnavailable` path.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
    offline: AtomicBool,
    pub gets: AtomicUsize,
    pub sets: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("in-memory backend offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.check()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.check()?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), CacheError> {
        self.check()?;
        self.entries.lock().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
