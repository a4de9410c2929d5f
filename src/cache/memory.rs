// src/cache/memory.rs
//! Tier 1: bounded in-process LRU.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::CacheEntry;

#[derive(Debug)]
pub struct MemoryTier {
    capacity: usize,
    inner: Mutex<Lru>,
}

#[derive(Debug, Default)]
struct Lru {
    map: HashMap<String, Slot>,
    /// Recency stamp → key. Smallest stamp is the least recently used.
    order: BTreeMap<u64, String>,
    tick: u64,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    stamp: u64,
}

impl Lru {
    fn next_stamp(&mut self) -> u64 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.map.remove(key)?;
        self.order.remove(&slot.stamp);
        Some(slot.entry)
    }
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Lru::default()),
        }
    }

    /// Look up a live entry and mark it most recently used. Expired entries are
    /// dropped on the way.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut lru = self.inner.lock();
        let expired = lru.map.get(key)?.entry.is_expired_at(now);
        if expired {
            lru.remove(key);
            return None;
        }
        let stamp = lru.next_stamp();
        let slot = lru.map.get_mut(key)?;
        let old = std::mem::replace(&mut slot.stamp, stamp);
        let entry = slot.entry.clone();
        lru.order.remove(&old);
        lru.order.insert(stamp, key.to_string());
        Some(entry)
    }

    /// Insert or replace, evicting least recently used entries over capacity.
    /// Returns how many entries were evicted.
    pub fn insert(&self, entry: CacheEntry) -> usize {
        let mut lru = self.inner.lock();
        let key = entry.key.clone();
        lru.remove(&key);
        let stamp = lru.next_stamp();
        lru.order.insert(stamp, key.clone());
        lru.map.insert(key, Slot { entry, stamp });

        let mut evicted = 0;
        while lru.map.len() > self.capacity {
            let Some((_, victim)) = lru.order.pop_first() else {
                break;
            };
            lru.map.remove(&victim);
            evicted += 1;
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut lru = self.inner.lock();
        let keys: Vec<String> = lru
            .map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for k in &keys {
            lru.remove(k);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut lru = self.inner.lock();
        lru.map.clear();
        lru.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTier;
    use std::time::Duration;

    fn entry(key: &str, ttl_ms: u64) -> CacheEntry {
        CacheEntry::new(key, key.as_bytes().to_vec(), Duration::from_millis(ttl_ms), CacheTier::Memory)
    }

    #[test]
    fn evicts_least_recently_used() {
        let t = MemoryTier::new(2);
        let now = Utc::now();
        t.insert(entry("a", 60_000));
        t.insert(entry("b", 60_000));
        // touch "a" so "b" becomes the LRU victim
        assert!(t.get("a", now).is_some());
        assert_eq!(t.insert(entry("c", 60_000)), 1);
        assert!(t.get("a", now).is_some());
        assert!(t.get("b", now).is_none());
        assert!(t.get("c", now).is_some());
    }

    #[test]
    fn expired_entries_miss_and_are_dropped() {
        let t = MemoryTier::new(4);
        t.insert(entry("a", 10));
        let later = Utc::now() + chrono::Duration::milliseconds(50);
        assert!(t.get("a", later).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn prefix_removal() {
        let t = MemoryTier::new(8);
        t.insert(entry("source:a:body", 60_000));
        t.insert(entry("source:a:configs", 60_000));
        t.insert(entry("source:b:body", 60_000));
        assert_eq!(t.remove_prefix("source:a:"), 2);
        assert_eq!(t.len(), 1);
    }
}
