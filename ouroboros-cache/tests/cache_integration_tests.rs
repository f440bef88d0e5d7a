//! Integration tests for the tiered cache
//!
//! These tests drive the public API end to end:
//! - Single-flight under concurrent load
//! - Document invalidation, redelivery and mid-computation races
//! - TTL with jitter and the stale window on a manual clock
//! - Degraded tiers and the distributed circuit breaker
//! - Predictive refresh sharing a flight with a foreground miss

use async_trait::async_trait;
use futures::future::join_all;
use ouroboros_cache::tiers::DistributedTier;
use ouroboros_cache::{
    AnswerSource, BreakerState, CacheConfig, CacheError, CacheKey, CacheKeyBuilder, CacheManager,
    ComputeError, ComputeOptions, ComputeResult, DocumentRef, DurableStore, EventType,
    FileDurableStore, InMemoryDistributedBackend, InMemoryDurableStore, InvalidationEvent, Lookup, ManualClock,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn key(query: &str, documents: &[(&str, &str)]) -> CacheKey {
    let refs: Vec<DocumentRef> = documents
        .iter()
        .map(|(id, version)| DocumentRef::new(*id, *version))
        .collect();
    CacheKeyBuilder::answers("llm-v1").build(query, &refs).unwrap()
}

/// Answer source that counts calls into a shared counter
struct CountingSource {
    calls: Arc<AtomicUsize>,
    latency: Duration,
}

#[async_trait]
impl AnswerSource for CountingSource {
    async fn compute(&self, key: &CacheKey) -> ComputeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(format!("refreshed:{}", key.query()).into_bytes())
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_concurrent_callers_share_one_computation() {
    let manager = Arc::new(
        CacheManager::builder(CacheConfig::default())
            .distributed(Arc::new(InMemoryDistributedBackend::new()))
            .build()
            .unwrap(),
    );
    let k = key("what is the refund policy?", &[("policy.pdf", "h1")]);
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..50).map(|_| {
        let manager = manager.clone();
        let k = k.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            manager
                .get_or_compute(&k, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(b"30 days".to_vec())
                })
                .await
        })
    });

    let results = join_all(callers).await;
    for result in results {
        assert_eq!(result.unwrap().unwrap(), b"30 days".to_vec());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = manager.stats().await;
    assert_eq!(stats.computations, 1);
    assert!(stats.contended > 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_compute_failure_reaches_every_waiter() {
    let manager = Arc::new(CacheManager::init(CacheConfig::default()).unwrap());
    let k = key("q", &[("d1", "h1")]);
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..10).map(|_| {
        let manager = manager.clone();
        let k = k.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            manager
                .get_or_compute(&k, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err(ComputeError::new("vector store unreachable"))
                })
                .await
        })
    });

    for result in join_all(callers).await {
        let err = result.unwrap().unwrap_err();
        assert_eq!(
            err,
            CacheError::Compute(ComputeError::new("vector store unreachable"))
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(manager.lookup(&k).await.unwrap().is_miss());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_timeout_cancels_leader_and_followers() {
    let manager = Arc::new(CacheManager::init(CacheConfig::default()).unwrap());
    let k = key("slow", &[("d1", "h1")]);

    let leader = {
        let manager = manager.clone();
        let k = k.clone();
        tokio::spawn(async move {
            manager
                .get_or_compute_with(
                    &k,
                    ComputeOptions::default().with_timeout(Duration::from_millis(100)),
                    || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(b"late".to_vec())
                    },
                )
                .await
        })
    };

    let probe = manager.clone();
    let probe_key = k.clone();
    wait_until(move || probe.in_flight(&probe_key)).await;

    let follower = manager
        .get_or_compute(&k, || async { Ok(b"unused".to_vec()) })
        .await;

    assert!(matches!(leader.await.unwrap(), Err(CacheError::Cancelled(_))));
    assert!(matches!(follower, Err(CacheError::Cancelled(_))));
    assert!(!manager.in_flight(&k));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_invalidating_a_document_drops_every_dependent_key() {
    let backend = Arc::new(InMemoryDistributedBackend::new());
    let durable = Arc::new(InMemoryDurableStore::new());
    let manager = CacheManager::builder(CacheConfig::default())
        .distributed(backend.clone())
        .durable(durable.clone())
        .build()
        .unwrap();

    let dependent = [
        key("q1", &[("d1", "v1")]),
        key("q2", &[("d1", "v1"), ("d2", "v1")]),
        key("q3", &[("d1", "v1"), ("d3", "v1")]),
    ];
    let unrelated = key("q4", &[("d2", "v1")]);

    for k in dependent.iter().chain(std::iter::once(&unrelated)) {
        manager
            .get_or_compute(k, || async { Ok(b"old".to_vec()) })
            .await
            .unwrap();
    }

    let report = manager.invalidate("d1").await;
    assert!(report.is_complete());
    assert_eq!(report.keys_invalidated, 3);

    for k in &dependent {
        assert!(manager.lookup(k).await.unwrap().is_miss());
        assert!(!durable.contains(k.fingerprint()));
        assert!(!backend.contains(&DistributedTier::storage_key(k.fingerprint())));
    }
    assert!(manager.lookup(&unrelated).await.unwrap().is_fresh());

    // recomputation after the invalidation is served
    let value = manager
        .get_or_compute(&dependent[0], || async { Ok(b"new".to_vec()) })
        .await
        .unwrap();
    assert_eq!(value, b"new".to_vec());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_event_is_a_no_op() {
    let manager = CacheManager::init(CacheConfig::default()).unwrap();
    let k = key("q", &[("d1", "v1")]);
    manager
        .get_or_compute(&k, || async { Ok(b"v".to_vec()) })
        .await
        .unwrap();

    let event = InvalidationEvent::new("d1", EventType::Reindexed, chrono::Utc::now());
    let first = manager.apply_event(event.clone()).await;
    let second = manager.apply_event(event).await;

    assert!(!first.duplicate);
    assert_eq!(first.keys_invalidated, 1);
    assert!(second.duplicate);
    assert_eq!(second.keys_invalidated, 0);
    assert_eq!(manager.stats().await.duplicate_events, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_invalidation_during_computation_discards_the_result() {
    let manager = Arc::new(CacheManager::init(CacheConfig::default()).unwrap());
    let k = key("q", &[("d1", "v1")]);
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let caller = {
        let manager = manager.clone();
        let k = k.clone();
        tokio::spawn(async move {
            manager
                .get_or_compute(&k, || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(b"computed from old text".to_vec())
                })
                .await
        })
    };

    started_rx.await.unwrap();
    manager.invalidate("d1").await;
    release_tx.send(()).unwrap();

    // the caller still gets its answer, but nothing is cached
    assert_eq!(
        caller.await.unwrap().unwrap(),
        b"computed from old text".to_vec()
    );
    assert!(manager.lookup(&k).await.unwrap().is_miss());
    assert_eq!(manager.stats().await.discarded_writes, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_delivery_flags_key_and_still_hides_old_value() {
    let durable = Arc::new(InMemoryDurableStore::new());
    let config = CacheConfig::builder()
        .invalidation_retries(1, Duration::from_millis(1))
        .build();
    let manager = CacheManager::builder(config)
        .durable(durable.clone())
        .build()
        .unwrap();
    let k = key("q", &[("d1", "v1")]);
    manager
        .get_or_compute(&k, || async { Ok(b"old".to_vec()) })
        .await
        .unwrap();

    durable.shutdown();
    let report = manager.invalidate("d1").await;
    assert!(!report.is_complete());
    assert!(matches!(
        report.failures[0],
        CacheError::InvalidationDeliveryFailure { attempts: 2, .. }
    ));
    assert_eq!(manager.possibly_stale_keys(), vec![k.fingerprint().to_string()]);

    // the durable record survived, but it predates the invalidation
    durable.restore();
    assert!(durable.contains(k.fingerprint()));
    assert!(manager.lookup(&k).await.unwrap().is_miss());
    assert!(!durable.contains(k.fingerprint()));

    manager
        .get_or_compute(&k, || async { Ok(b"new".to_vec()) })
        .await
        .unwrap();
    assert!(manager.possibly_stale_keys().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_ttl_with_jitter_and_stale_window() {
    let clock = ManualClock::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig::builder()
        .uniform_ttl(Duration::from_secs(300), Duration::from_secs(10))
        .stale_window(Duration::from_secs(30))
        .build();
    let manager = CacheManager::builder(config)
        .clock(Arc::new(clock.clone()))
        .answer_source(Arc::new(CountingSource {
            calls: calls.clone(),
            latency: Duration::from_millis(10),
        }))
        .background_tasks(false)
        .build()
        .unwrap();

    let k = key("q", &[("d1", "v1")]);
    manager
        .get_or_compute(&k, || async { Ok(b"original".to_vec()) })
        .await
        .unwrap();

    // still fresh at the low end of the jitter range
    clock.advance(Duration::from_secs(289));
    assert!(manager.lookup(&k).await.unwrap().is_fresh());

    // past the high end: stale, and a refresh is running
    clock.advance(Duration::from_secs(22));
    match manager.lookup(&k).await.unwrap() {
        Lookup::Stale { entry, refreshing } => {
            assert!(refreshing);
            assert_eq!(entry.value, b"original".to_vec());
        }
        other => panic!("expected stale entry, got {:?}", other),
    }

    let coordinator = manager.coordinator().clone();
    wait_until(move || coordinator.metrics().snapshot().refreshes_completed == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    match manager.lookup(&k).await.unwrap() {
        Lookup::Fresh(entry) => assert_eq!(entry.value, b"refreshed:q".to_vec()),
        other => panic!("expected refreshed entry, got {:?}", other),
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn test_lower_tiers_share_the_freshness_of_tier1() {
    // default policies: Tier1 300±10s, Tier2 and Tier3 retain for much longer
    let clock = ManualClock::default();
    let durable = Arc::new(InMemoryDurableStore::new());
    let manager = CacheManager::builder(CacheConfig::default())
        .clock(Arc::new(clock.clone()))
        .distributed(Arc::new(InMemoryDistributedBackend::new()))
        .durable(durable.clone())
        .background_tasks(false)
        .build()
        .unwrap();

    let k = key("q", &[("d1", "v1")]);
    manager
        .get_or_compute(&k, || async { Ok(b"original".to_vec()) })
        .await
        .unwrap();

    clock.advance(Duration::from_secs(311));
    let local = &manager.coordinator().tiers().local;
    local.delete(k.fingerprint()).await;

    // Tier2 still holds the bytes but not a fresh result
    match manager.lookup(&k).await.unwrap() {
        Lookup::Stale { entry, .. } => assert_eq!(entry.value, b"original".to_vec()),
        other => panic!("expected stale entry, got {:?}", other),
    }
    assert!(local.peek(k.fingerprint()).await.is_none());

    clock.advance(Duration::from_secs(30));
    assert!(manager.lookup(&k).await.unwrap().is_miss());
    // retained for cold starts, never served
    assert!(durable.contains(k.fingerprint()));

    let value = manager
        .get_or_compute(&k, || async { Ok(b"recomputed".to_vec()) })
        .await
        .unwrap();
    assert_eq!(value, b"recomputed".to_vec());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_expired_entry_is_never_served() {
    let clock = ManualClock::default();
    let config = CacheConfig::builder()
        .uniform_ttl(Duration::from_secs(300), Duration::from_secs(10))
        .stale_window(Duration::from_secs(30))
        .serve_stale(true)
        .build();
    let manager = CacheManager::builder(config)
        .clock(Arc::new(clock.clone()))
        .background_tasks(false)
        .build()
        .unwrap();

    let k = key("q", &[("d1", "v1")]);
    manager
        .get_or_compute(&k, || async { Ok(b"original".to_vec()) })
        .await
        .unwrap();

    clock.advance(Duration::from_secs(341));
    assert!(manager.lookup(&k).await.unwrap().is_miss());

    let value = manager
        .get_or_compute(&k, || async { Ok(b"recomputed".to_vec()) })
        .await
        .unwrap();
    assert_eq!(value, b"recomputed".to_vec());
    assert_eq!(manager.stats().await.stale_served, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_serve_stale_returns_old_value_while_refreshing() {
    let clock = ManualClock::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig::builder()
        .uniform_ttl(Duration::from_secs(60), Duration::ZERO)
        .stale_window(Duration::from_secs(30))
        .serve_stale(true)
        .build();
    let manager = CacheManager::builder(config)
        .clock(Arc::new(clock.clone()))
        .answer_source(Arc::new(CountingSource {
            calls: calls.clone(),
            latency: Duration::from_millis(50),
        }))
        .background_tasks(false)
        .build()
        .unwrap();

    let k = key("q", &[("d1", "v1")]);
    manager
        .get_or_compute(&k, || async { Ok(b"original".to_vec()) })
        .await
        .unwrap();

    clock.advance(Duration::from_secs(70));
    let value = manager
        .get_or_compute(&k, || async { Err(ComputeError::new("foreground must not compute")) })
        .await
        .unwrap();
    assert_eq!(value, b"original".to_vec());

    let coordinator = manager.coordinator().clone();
    wait_until(move || coordinator.metrics().snapshot().refreshes_completed == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().await.stale_served, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_distributed_outage_falls_through_to_durable() {
    let backend = Arc::new(InMemoryDistributedBackend::new());
    let config = CacheConfig::builder()
        .breaker_failure_threshold(3)
        .breaker_cool_down(Duration::from_secs(60))
        .build();
    let manager = CacheManager::builder(config)
        .distributed(backend.clone())
        .build()
        .unwrap();

    let keys: Vec<CacheKey> = (0..10)
        .map(|i| key(&format!("q{}", i), &[("d1", "v1")]))
        .collect();
    for k in &keys {
        manager
            .get_or_compute(k, || async { Ok(b"v".to_vec()) })
            .await
            .unwrap();
    }

    backend.shutdown();
    manager.coordinator().tiers().local.clear().await;

    for i in 0..100 {
        let value = manager
            .get_or_compute(&keys[i % keys.len()], || async {
                Err(ComputeError::new("should be served from the durable tier"))
            })
            .await
            .unwrap();
        assert_eq!(value, b"v".to_vec());
    }

    let distributed = manager.coordinator().tiers().distributed.clone().unwrap();
    assert_eq!(distributed.breaker().state(), BreakerState::Open);
    assert!(!distributed.is_available());

    let stats = manager.stats().await;
    assert_eq!(stats.durable.hits, 10);
    assert!(stats.distributed.errors >= 1);
    assert_eq!(stats.computations, 10);

    // new keys still compute and cache without Tier2
    let fresh = key("new", &[("d1", "v1")]);
    manager
        .get_or_compute(&fresh, || async { Ok(b"n".to_vec()) })
        .await
        .unwrap();
    assert!(manager.lookup(&fresh).await.unwrap().is_fresh());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_durable_outage_still_answers() {
    let durable = Arc::new(InMemoryDurableStore::new());
    durable.shutdown();
    let manager = CacheManager::builder(CacheConfig::default())
        .durable(durable)
        .build()
        .unwrap();

    let k = key("q", &[("d1", "v1")]);
    let value = manager
        .get_or_compute(&k, || async { Ok(b"v".to_vec()) })
        .await
        .unwrap();
    assert_eq!(value, b"v".to_vec());
    assert!(manager.lookup(&k).await.unwrap().is_fresh());
    assert_eq!(manager.stats().await.write_failures, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_distributed_bytes_are_a_miss() {
    let backend = Arc::new(InMemoryDistributedBackend::new());
    let manager = CacheManager::builder(CacheConfig::default())
        .distributed(backend.clone())
        .build()
        .unwrap();

    let k = key("q", &[("d1", "v1")]);
    let storage_key = DistributedTier::storage_key(k.fingerprint());
    backend.insert_raw(&storage_key, b"\x00\x01 not an entry".to_vec(), Duration::from_secs(60));

    let value = manager
        .get_or_compute(&k, || async { Ok(b"computed".to_vec()) })
        .await
        .unwrap();
    assert_eq!(value, b"computed".to_vec());

    // the garbage was replaced by the write-back
    assert!(backend.contains(&storage_key));
    manager.coordinator().tiers().local.clear().await;
    assert!(manager.lookup(&k).await.unwrap().is_fresh());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_predictive_refresh_shares_flight_with_foreground_miss() {
    let clock = ManualClock::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig::builder()
        .uniform_ttl(Duration::from_secs(60), Duration::ZERO)
        .stale_window(Duration::from_secs(30))
        .lookahead(Duration::from_secs(30))
        .score_threshold(1.0)
        .build();
    let manager = CacheManager::builder(config)
        .clock(Arc::new(clock.clone()))
        .answer_source(Arc::new(CountingSource {
            calls: calls.clone(),
            latency: Duration::from_millis(300),
        }))
        .background_tasks(false)
        .build()
        .unwrap();

    let k = key("hot question", &[("d1", "v1")]);
    let foreground_calls = calls.clone();
    manager
        .get_or_compute(&k, || async move {
            foreground_calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"original".to_vec())
        })
        .await
        .unwrap();
    for _ in 0..4 {
        manager.lookup(&k).await.unwrap();
    }

    // 30s before expiry the key is a refresh candidate
    clock.advance(Duration::from_secs(30));
    assert_eq!(manager.sweep_now().await, 1);

    let probe = manager.coordinator().clone();
    let probe_key = k.clone();
    wait_until(move || probe.is_in_flight(&probe_key)).await;

    // the entry lapses while the refresh is still running
    clock.advance(Duration::from_secs(35));
    let foreground_calls = calls.clone();
    let value = manager
        .get_or_compute(&k, || async move {
            foreground_calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"foreground".to_vec())
        })
        .await
        .unwrap();

    assert_eq!(value, b"refreshed:hot question".to_vec());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let stats = manager.stats().await;
    assert_eq!(stats.refreshes_scheduled, 1);
    assert_eq!(stats.contended, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_cleanup_retires_keys_past_retention() {
    let clock = ManualClock::default();
    let durable = Arc::new(InMemoryDurableStore::new());
    let config = CacheConfig::builder()
        .uniform_ttl(Duration::from_secs(60), Duration::ZERO)
        .stale_window(Duration::from_secs(30))
        .build();
    let manager = CacheManager::builder(config)
        .clock(Arc::new(clock.clone()))
        .durable(durable.clone())
        .background_tasks(false)
        .build()
        .unwrap();

    let keys: Vec<CacheKey> = (0..100)
        .map(|i| key(&format!("question {}", i), &[("d1", "v1")]))
        .collect();
    for k in &keys {
        manager
            .get_or_compute(k, || async { Ok(b"v".to_vec()) })
            .await
            .unwrap();
    }
    let index = manager.coordinator().index().clone();
    assert_eq!(index.len(), 100);

    // within retention nothing is retired
    manager.cleanup_now().await;
    assert_eq!(index.len(), 100);

    clock.advance(Duration::from_secs(120));
    manager
        .get_or_compute(&keys[0], || async { Ok(b"again".to_vec()) })
        .await
        .unwrap();
    manager.cleanup_now().await;

    assert_eq!(index.len(), 1);
    assert_eq!(index.keys_for("d1"), vec![keys[0].fingerprint().to_string()]);
    assert_eq!(durable.len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_invalidation_after_restart_reaches_durable_records() {
    let dir = tempfile::tempdir().unwrap();
    let stale = key("q", &[("d1", "v1")]);
    let unrelated = key("q", &[("d2", "v1")]);
    let build = || {
        CacheManager::builder(CacheConfig::default())
            .durable(Arc::new(FileDurableStore::new(dir.path())))
            .background_tasks(false)
            .build()
            .unwrap()
    };

    let first = build();
    for k in [&stale, &unrelated] {
        first
            .get_or_compute(k, || async { Ok(b"before restart".to_vec()) })
            .await
            .unwrap();
    }
    first.shutdown().await;
    drop(first);

    // memory is empty, the records are on disk
    let second = build();
    let report = second.invalidate("d1").await;
    assert!(report.is_complete());
    assert_eq!(report.keys_invalidated, 1);
    second.shutdown().await;
    drop(second);

    let store = FileDurableStore::new(dir.path());
    assert_eq!(
        store.list_keys().await.unwrap(),
        vec![unrelated.fingerprint().to_string()]
    );

    // no watermark survives this restart, and nothing stale is left to serve
    let third = build();
    assert!(third.lookup(&stale).await.unwrap().is_miss());
    assert!(third.lookup(&unrelated).await.unwrap().is_fresh());
    third.shutdown().await;
}
