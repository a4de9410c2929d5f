// src/cache/disk.rs
//! Tier 3: persistent directory of JSON entry files.
//!
//! One file per key, named by a SHA-256 prefix of the key. Writes go to a
//! unique `.tmp` sibling and are renamed into place so readers never see half
//! a file.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;

use super::CacheEntry;
use crate::error::CacheError;

/// Prune the directory every this many writes.
const PRUNE_EVERY: u64 = 64;

#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    max_entries: usize,
    writes: AtomicU64,
}

impl DiskTier {
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            dir: dir.into(),
            max_entries: max_entries.max(1),
            writes: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }

    pub async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Unavailable(format!("disk read: {e}"))),
        };
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(e) => e,
            Err(e) => {
                let _ = fs::remove_file(&path).await;
                return Err(CacheError::Corrupt(e.to_string()));
            }
        };
        // Stem collision: different key behind the same file name.
        if entry.key != key {
            return Ok(None);
        }
        if entry.is_expired_at(now) {
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    pub async fn set(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::Unavailable(format!("disk mkdir: {e}")))?;
        let path = self.path_for(&entry.key);
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_vec(entry).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        fs::write(&tmp, json)
            .await
            .map_err(|e| CacheError::Unavailable(format!("disk write: {e}")))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::Unavailable(format!("disk rename: {e}")))?;

        if self.writes.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(Utc::now()).await;
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Unavailable(format!("disk remove: {e}"))),
        }
    }

    /// Remove every entry whose key starts with `prefix` (empty prefix = all).
    pub async fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut removed = 0;
        for (path, entry) in self.scan().await? {
            if entry.key.starts_with(prefix) && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop expired entries, then the oldest ones while above `max_entries`.
    pub async fn prune(&self, now: DateTime<Utc>) {
        let Ok(mut entries) = self.scan().await else {
            return;
        };
        let mut live = Vec::with_capacity(entries.len());
        for (path, entry) in entries.drain(..) {
            if entry.is_expired_at(now) {
                let _ = fs::remove_file(&path).await;
            } else {
                live.push((path, entry));
            }
        }
        if live.len() <= self.max_entries {
            return;
        }
        live.sort_by_key(|(_, e)| e.inserted_at);
        let excess = live.len() - self.max_entries;
        for (path, _) in live.into_iter().take(excess) {
            let _ = fs::remove_file(&path).await;
        }
    }

    async fn scan(&self) -> Result<Vec<(PathBuf, CacheEntry)>, CacheError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(CacheError::Unavailable(format!("disk scan: {e}"))),
        };
        while let Ok(Some(de)) = rd.next_entry().await {
            let path = de.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => out.push((path, entry)),
                Err(_) => {
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
        Ok(out)
    }
}

fn file_stem(key: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(32);
    for b in digest.iter().take(16) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTier;
    use std::time::Duration;

    #[tokio::test]
    async fn survives_a_new_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let e = CacheEntry::new("k", b"v".to_vec(), Duration::from_secs(60), CacheTier::Disk);
        DiskTier::new(tmp.path(), 10).set(&e).await.unwrap();

        let reopened = DiskTier::new(tmp.path(), 10);
        let got = reopened.get("k", Utc::now()).await.unwrap().unwrap();
        assert_eq!(got.value, b"v".to_vec());
    }

    #[tokio::test]
    async fn expired_entry_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(tmp.path(), 10);
        let e = CacheEntry::new("k", b"v".to_vec(), Duration::from_millis(5), CacheTier::Disk);
        tier.set(&e).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(tier.get("k", later).await.unwrap().is_none());
        assert!(tier.get("k", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_newest_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(tmp.path(), 2);
        for k in ["a", "b", "c"] {
            let e = CacheEntry::new(k, vec![1], Duration::from_secs(60), CacheTier::Disk);
            tier.set(&e).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tier.prune(Utc::now()).await;
        let now = Utc::now();
        assert!(tier.get("a", now).await.unwrap().is_none());
        assert!(tier.get("c", now).await.unwrap().is_some());
    }
}
