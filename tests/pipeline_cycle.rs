// tests/pipeline_cycle.rs
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use vpn_config_aggregator::cache::{body_key, CacheEntry, CacheScope, CacheTier, DistributedBackend, InMemoryBackend};
use vpn_config_aggregator::config::AggregatorSettings;
use vpn_config_aggregator::error::ErrorKind;
use vpn_config_aggregator::fetch::{MockHttpClient, MockReply};
use vpn_config_aggregator::pipeline::{Aggregator, SourceStatus};
use vpn_config_aggregator::reputation::ReputationState;
use vpn_config_aggregator::types::{ContentHint, Protocol, Source, SourceSet, SourceTier};

const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

fn source(id: &str, tier: SourceTier) -> Source {
    Source {
        id: id.into(),
        url: format!("https://{id}.example.com/sub.txt"),
        tier,
        weight: 1.0,
        expected_protocols: BTreeSet::new(),
        encoding: ContentHint::Plain,
    }
}

fn url(id: &str) -> String {
    format!("https://{id}.example.com/sub.txt")
}

fn settings() -> AggregatorSettings {
    let mut s = AggregatorSettings::default();
    s.cache.disk_dir = None;
    s.retry.base_delay_ms = 1;
    s.retry.max_delay_ms = 5;
    s
}

fn aggregator(settings: AggregatorSettings, http: &Arc<MockHttpClient>) -> Aggregator {
    Aggregator::builder(settings)
        .with_http_client(http.clone())
        .ephemeral()
        .build()
        .unwrap()
}

#[tokio::test]
async fn same_endpoint_from_two_sources_is_published_once() {
    let alpha = format!(
        "vless://{UUID}@SHARED.example.com:443?security=tls#alpha\n\
         trojan://pw1@t1.example.com:443\n"
    );
    let beta = format!(
        "# mirror of alpha\n\
         vless://{}@shared.example.com:443?security=tls#beta\n\
         trojan://pw2@t2.example.com:443\n",
        UUID.to_uppercase()
    );
    let http = Arc::new(
        MockHttpClient::new()
            .with(&url("alpha"), MockReply::Ok(alpha.into_bytes()))
            .with(&url("beta"), MockReply::Ok(beta.into_bytes())),
    );
    let agg = aggregator(settings(), &http);
    let set = SourceSet {
        sources: vec![source("beta", SourceTier::Bulk), source("alpha", SourceTier::Premium)],
    };

    let r = agg.run_cycle(&set).await;
    assert_eq!(r.stats.published, 3);
    assert_eq!(r.stats.duplicates, 1);
    assert_eq!(r.stats.new_keys, 3);
    assert_eq!(r.stats.added, 3);
    assert_eq!(r.stats.per_protocol.get("trojan"), Some(&2));

    let vless: Vec<_> = r.configurations.iter().filter(|c| c.protocol == Protocol::Vless).collect();
    assert_eq!(vless.len(), 1);
    assert_eq!(vless[0].source_id, "alpha");
    for c in &r.configurations {
        let score = c.quality_score.unwrap();
        assert!((0.0..=1.0).contains(&score));
        assert!(c.canonical_key.is_some());
    }
    // Ranked: non-increasing score.
    assert!(r
        .configurations
        .windows(2)
        .all(|w| w[0].quality_score >= w[1].quality_score));

    // Second cycle is served from the parsed-set cache and publishes the same keys.
    let r2 = agg.run_cycle(&set).await;
    assert_eq!(http.calls(&url("alpha")), 1);
    assert_eq!(http.calls(&url("beta")), 1);
    assert_eq!(r2.stats.sources_configs_cached, 2);
    assert_eq!(r2.stats.published, 3);
    assert_eq!(r2.stats.duplicates, 1);
    assert_eq!(r2.stats.returning_keys, 3);
    assert_eq!((r2.stats.added, r2.stats.removed), (0, 0));

    let first: BTreeSet<_> = r.configurations.iter().map(|c| c.canonical_key.clone()).collect();
    let second: BTreeSet<_> = r2.configurations.iter().map(|c| c.canonical_key.clone()).collect();
    assert_eq!(first, second);
}

#[tokio::test]
async fn hostile_source_is_quarantined_until_reset() {
    let good = "trojan://pw@good-node.example.com:443\n";
    let evil = "<script>steal()</script>\n\
                javascript:alert(1)\n\
                x' OR 1=1; DROP TABLE users--\n\
                trojan://pw@evil-node.example.com:443\n";
    let http = Arc::new(
        MockHttpClient::new()
            .with(&url("good"), MockReply::Ok(good.as_bytes().to_vec()))
            .with(&url("evil"), MockReply::Ok(evil.as_bytes().to_vec())),
    );
    let agg = aggregator(settings(), &http);
    let set = SourceSet {
        sources: vec![source("good", SourceTier::Reliable), source("evil", SourceTier::Bulk)],
    };

    let r = agg.run_cycle(&set).await;
    assert_eq!(r.stats.error_count(ErrorKind::ParseSecurityRejected), 3);
    assert_eq!(r.stats.dropped_quarantined, 1);
    assert!(r.configurations.iter().all(|c| c.source_id == "good"));
    assert_eq!(
        agg.reputation_snapshot("evil").unwrap().state,
        ReputationState::Quarantined
    );

    // Never fetched again while quarantined.
    let r = agg.run_cycle(&set).await;
    assert_eq!(http.calls(&url("evil")), 1);
    assert_eq!(r.stats.sources_skipped, 1);
    assert!(!r.stats.per_source.contains_key("evil"));

    assert!(agg.reset_reputation("evil").await);
    assert!(agg.reputation_snapshot("evil").is_none());
    let _ = agg.run_cycle(&set).await;
    assert_eq!(http.calls(&url("evil")), 2);
}

#[tokio::test]
async fn failing_sources_do_not_abort_the_cycle() {
    let http = Arc::new(
        MockHttpClient::new()
            .with(&url("ok"), MockReply::Ok(b"trojan://pw@ok-node.example.com:443\n".to_vec()))
            .with(&url("gone"), MockReply::Status(404))
            .with(&url("flaky"), MockReply::Status(503))
            .with(
                &url("flaky"),
                MockReply::Ok(b"trojan://pw@flaky-node.example.com:443\n".to_vec()),
            ),
    );
    let agg = aggregator(settings(), &http);
    let set = SourceSet {
        sources: vec![
            source("ok", SourceTier::Reliable),
            source("gone", SourceTier::Reliable),
            source("flaky", SourceTier::Reliable),
        ],
    };

    let r = agg.run_cycle(&set).await;
    assert_eq!(http.calls(&url("gone")), 1, "404 is not retried");
    assert_eq!(http.calls(&url("flaky")), 2, "503 is retried");
    assert_eq!(r.stats.published, 2);
    assert_eq!(r.stats.sources_failed, 1);
    assert_eq!(r.stats.error_count(ErrorKind::FetchHttpError), 1);

    let gone = &r.stats.per_source["gone"];
    assert_eq!(gone.status, SourceStatus::FetchFailed);
    assert_eq!(gone.http_status, Some(404));
    assert_eq!(r.stats.per_source["flaky"].attempts, 2);
}

#[tokio::test]
async fn open_breaker_skips_the_network() {
    let mut s = settings();
    s.breaker.failure_threshold = 1;
    s.retry.max_attempts = 1;
    let http = Arc::new(MockHttpClient::new().with(&url("down"), MockReply::Status(500)));
    let agg = aggregator(s, &http);
    let set = SourceSet {
        sources: vec![source("down", SourceTier::Bulk)],
    };

    let r = agg.run_cycle(&set).await;
    assert_eq!(r.stats.error_count(ErrorKind::FetchHttpError), 1);

    let r = agg.run_cycle(&set).await;
    assert_eq!(http.calls(&url("down")), 1);
    assert_eq!(r.stats.error_count(ErrorKind::FetchBreakerOpen), 1);
    assert!(r.configurations.is_empty());

    // Our own breaker is not held against the source.
    let rep = agg.reputation_snapshot("down").unwrap();
    assert_eq!(rep.state, ReputationState::Probation);
    assert_eq!(rep.consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn sources_not_started_before_the_deadline_are_skipped() {
    let mut s = settings();
    s.fetch.cycle_deadline_secs = 1;
    s.fetch.timeout_secs = 5;
    s.fetch.max_concurrency = 1;
    let http = Arc::new(
        MockHttpClient::new()
            .with(&url("slow"), MockReply::Hang)
            .with(&url("late"), MockReply::Ok(b"trojan://pw@late.example.com:443\n".to_vec())),
    );
    let agg = aggregator(s, &http);
    // Premium is scheduled first, so the hanging source eats the budget.
    let set = SourceSet {
        sources: vec![source("late", SourceTier::Bulk), source("slow", SourceTier::Premium)],
    };

    let r = agg.run_cycle(&set).await;
    assert_eq!(r.stats.error_count(ErrorKind::FetchTimeout), 1);
    assert_eq!(r.stats.deadline_skipped, 1);
    assert_eq!(http.calls(&url("late")), 0);
    assert_eq!(r.stats.per_source["late"].status, SourceStatus::DeadlineSkipped);
    assert!(r.configurations.is_empty());
}

#[tokio::test]
async fn output_is_truncated_to_max_results() {
    let mut s = settings();
    s.output.max_results = 1;
    let body = "trojan://a@n1.example.com:443\ntrojan://b@n2.example.com:443\ntrojan://c@n3.example.com:443\n";
    let http = Arc::new(MockHttpClient::new().with(&url("one"), MockReply::Ok(body.as_bytes().to_vec())));
    let agg = aggregator(s, &http);
    let set = SourceSet {
        sources: vec![source("one", SourceTier::Premium)],
    };

    let r = agg.run_cycle(&set).await;
    assert_eq!(r.configurations.len(), 1);
    assert_eq!(r.stats.published, 1);
    assert_eq!(r.stats.truncated, 2);
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = settings();
    s.reputation.state_path = dir.path().join("reputation.json");
    s.dedup.filter_path = dir.path().join("dedup.json");
    s.dedup.expected_items = 1_000;

    let body = b"trojan://pw@persist.example.com:443\n".to_vec();
    let http = Arc::new(MockHttpClient::new().with(&url("p"), MockReply::Ok(body)));
    let set = SourceSet {
        sources: vec![source("p", SourceTier::Reliable)],
    };

    {
        let agg = Aggregator::builder(s.clone())
            .with_http_client(http.clone())
            .build()
            .unwrap();
        let r = agg.run_cycle(&set).await;
        assert_eq!(r.stats.new_keys, 1);
    }
    assert!(s.reputation.state_path.exists());
    assert!(s.dedup.filter_path.exists());

    let agg = Aggregator::builder(s).with_http_client(http.clone()).build().unwrap();
    assert_eq!(
        agg.reputation_snapshot("p").unwrap().state,
        ReputationState::Probation
    );
    let r = agg.run_cycle(&set).await;
    assert_eq!(r.stats.new_keys, 0);
    assert_eq!(r.stats.returning_keys, 1);
    assert_eq!(r.stats.published, 1);
}

#[tokio::test]
async fn cached_bad_body_is_not_judged_twice() {
    let backend = Arc::new(InMemoryBackend::new());
    backend
        .set(CacheEntry::new(
            body_key("replay"),
            b"garbage-line\n".to_vec(),
            Duration::from_secs(600),
            CacheTier::Distributed,
        ))
        .await
        .unwrap();
    let http = Arc::new(MockHttpClient::new());
    let agg = Aggregator::builder(settings())
        .with_http_client(http.clone())
        .with_distributed_cache(backend.clone())
        .ephemeral()
        .build()
        .unwrap();
    let set = SourceSet {
        sources: vec![source("replay", SourceTier::Premium)],
    };

    let r = agg.run_cycle(&set).await;
    assert_eq!(http.calls(&url("replay")), 0);
    assert_eq!(r.stats.sources_body_cached, 1);
    assert_eq!(r.stats.per_source["replay"].status, SourceStatus::Empty);
    assert!(agg.reputation_snapshot("replay").is_none());
    // Dropped from the shared tier so the next cycle goes to the network.
    assert!(!backend.contains(&body_key("replay")));
}

#[tokio::test]
async fn empty_body_is_refetched_instead_of_replayed() {
    let mut s = settings();
    s.reputation.trusted_after_successes = 1;
    s.reputation.suspend_after_failures = 2;
    let http = Arc::new(
        MockHttpClient::new().with(&url("flaky"), MockReply::Ok(b"trojan://pw@node.example.com:443\n".to_vec())),
    );
    http.push(&url("flaky"), MockReply::Ok(b"garbage-line\n".to_vec()));
    let agg = aggregator(s, &http);
    let set = SourceSet {
        sources: vec![source("flaky", SourceTier::Premium)],
    };

    let _ = agg.run_cycle(&set).await;
    assert_eq!(agg.reputation_snapshot("flaky").unwrap().state, ReputationState::Trusted);

    agg.invalidate_cache(CacheScope::Source("flaky".into())).await;
    let r = agg.run_cycle(&set).await;
    assert_eq!(http.calls(&url("flaky")), 2);
    assert_eq!(r.stats.per_source["flaky"].status, SourceStatus::Empty);
    let rep = agg.reputation_snapshot("flaky").unwrap();
    assert_eq!(rep.state, ReputationState::Trusted);
    assert_eq!(rep.consecutive_failures, 1);

    // One real failure per fetch: the third cycle hits the network again.
    let r = agg.run_cycle(&set).await;
    assert_eq!(http.calls(&url("flaky")), 3);
    assert_eq!(r.stats.per_source["flaky"].status, SourceStatus::Empty);
    let rep = agg.reputation_snapshot("flaky").unwrap();
    assert_eq!(rep.consecutive_failures, 2);
    assert_eq!(rep.state, ReputationState::Suspended);
}

#[tokio::test]
async fn offline_shared_cache_is_reported_in_cycle_stats() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_offline(true);
    let http = Arc::new(
        MockHttpClient::new().with(&url("p"), MockReply::Ok(b"trojan://pw@node.example.com:443\n".to_vec())),
    );
    let agg = Aggregator::builder(settings())
        .with_http_client(http.clone())
        .with_distributed_cache(backend.clone())
        .ephemeral()
        .build()
        .unwrap();
    let set = SourceSet {
        sources: vec![source("p", SourceTier::Premium)],
    };

    let r = agg.run_cycle(&set).await;
    assert_eq!(r.stats.published, 1);
    assert!(r.stats.error_count(ErrorKind::CacheUnavailable) > 0);

    // Each cycle reports only its own tier errors.
    backend.set_offline(false);
    let r = agg.run_cycle(&set).await;
    assert_eq!(r.stats.error_count(ErrorKind::CacheUnavailable), 0);
}
