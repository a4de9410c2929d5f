// tests/cache_tiers.rs
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use vpn_config_aggregator::cache::{CacheScope, DistributedBackend, InMemoryBackend, MultiTierCache};
use vpn_config_aggregator::config::CacheSettings;

fn settings(dir: &std::path::Path) -> CacheSettings {
    CacheSettings {
        disk_dir: Some(dir.to_path_buf()),
        ..CacheSettings::default()
    }
}

#[tokio::test]
async fn writes_reach_every_tier() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let cache = MultiTierCache::from_settings(&settings(dir.path()), Some(backend.clone() as Arc<dyn DistributedBackend>));

    cache.set("source:a:body", b"hello".to_vec(), Duration::from_secs(60)).await;
    cache.flush().await;
    assert!(backend.contains("source:a:body"));

    // Fresh process: memory is empty, the disk copy still answers.
    let cold = MultiTierCache::from_settings(&settings(dir.path()), None);
    assert_eq!(cold.get("source:a:body").await, Some(b"hello".to_vec()));
}

#[tokio::test]
async fn offline_distributed_tier_degrades_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_offline(true);

    let cache = MultiTierCache::from_settings(&settings(dir.path()), Some(backend.clone() as Arc<dyn DistributedBackend>));
    cache.set("k", b"v".to_vec(), Duration::from_secs(60)).await;
    cache.flush().await;
    assert!(!backend.contains("k"));

    let cold = MultiTierCache::from_settings(&settings(dir.path()), Some(backend.clone() as Arc<dyn DistributedBackend>));
    assert_eq!(cold.get("k").await, Some(b"v".to_vec()));
}

#[tokio::test]
async fn disk_hit_is_promoted_upwards() {
    let dir = tempfile::tempdir().unwrap();
    let writer = MultiTierCache::from_settings(&settings(dir.path()), None);
    writer.set("k", b"v".to_vec(), Duration::from_secs(60)).await;
    writer.flush().await;

    let backend = Arc::new(InMemoryBackend::new());
    let reader = MultiTierCache::from_settings(&settings(dir.path()), Some(backend.clone() as Arc<dyn DistributedBackend>));
    assert_eq!(reader.memory_len(), 0);
    assert_eq!(reader.get("k").await, Some(b"v".to_vec()));
    reader.flush().await;

    assert_eq!(reader.memory_len(), 1);
    assert!(backend.contains("k"));
}

#[tokio::test]
async fn source_scope_invalidation_spares_other_sources() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let cache = MultiTierCache::from_settings(&settings(dir.path()), Some(backend.clone() as Arc<dyn DistributedBackend>));
    let ttl = Duration::from_secs(60);
    cache.set("source:a:body", b"1".to_vec(), ttl).await;
    cache.set("source:a:configs", b"[]".to_vec(), ttl).await;
    cache.set("source:b:body", b"2".to_vec(), ttl).await;

    cache.invalidate_scope(&CacheScope::Source("a".into())).await;

    assert_eq!(cache.get("source:a:body").await, None);
    assert_eq!(cache.get("source:a:configs").await, None);
    assert!(!backend.contains("source:a:body"));
    assert_eq!(cache.get("source:b:body").await, Some(b"2".to_vec()));
}

#[tokio::test]
async fn expired_entries_are_misses_on_every_tier() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let cache = MultiTierCache::from_settings(&settings(dir.path()), Some(backend.clone() as Arc<dyn DistributedBackend>));
    cache.set("k", b"v".to_vec(), Duration::from_millis(1)).await;
    cache.flush().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.get("k").await, None);
}

#[tokio::test]
async fn distributed_hit_is_promoted_to_memory() {
    let backend = Arc::new(InMemoryBackend::new());
    let no_disk = CacheSettings {
        disk_dir: None,
        ..CacheSettings::default()
    };
    let writer = MultiTierCache::from_settings(&no_disk, Some(backend.clone() as Arc<dyn DistributedBackend>));
    writer.set("k", b"shared".to_vec(), Duration::from_secs(60)).await;
    writer.flush().await;

    let reader = MultiTierCache::from_settings(&no_disk, Some(backend.clone() as Arc<dyn DistributedBackend>));
    assert_eq!(reader.memory_len(), 0);
    assert_eq!(reader.get("k").await, Some(b"shared".to_vec()));
    assert_eq!(reader.memory_len(), 1);
    let gets = backend.gets.load(Ordering::Relaxed);

    // Served from memory now; the shared tier is not asked again.
    assert_eq!(reader.get("k").await, Some(b"shared".to_vec()));
    assert_eq!(backend.gets.load(Ordering::Relaxed), gets);
}

#[tokio::test]
async fn tier_errors_are_counted_until_taken() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_offline(true);
    let no_disk = CacheSettings {
        disk_dir: None,
        ..CacheSettings::default()
    };
    let cache = MultiTierCache::from_settings(&no_disk, Some(backend.clone() as Arc<dyn DistributedBackend>));

    cache.set("k", b"v".to_vec(), Duration::from_secs(60)).await;
    cache.flush().await;
    assert_eq!(cache.get("missing").await, None);

    assert_eq!(cache.take_degraded(), 2);
    assert_eq!(cache.take_degraded(), 0);
}

#[tokio::test]
async fn background_eviction_is_not_undone_by_queued_writes() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let cache = MultiTierCache::from_settings(&settings(dir.path()), Some(backend.clone() as Arc<dyn DistributedBackend>));

    // The lower-tier writes of this set are still queued when the eviction is issued.
    cache.set("source:a:body", b"stale".to_vec(), Duration::from_secs(60)).await;
    cache.evict_in_background("source:a:body");
    assert_eq!(cache.memory_len(), 0);
    cache.flush().await;

    assert!(!backend.contains("source:a:body"));
    let cold = MultiTierCache::from_settings(&settings(dir.path()), None);
    assert_eq!(cold.get("source:a:body").await, None);
}
