//! Tier2: shared network cache
//!
//! The backend is any key/value store with per-key TTL (Redis, Memcached, ...).
//! [`DistributedTier`] adds the timeout, the circuit breaker and entry
//! encoding on top of it.

use super::breaker::CircuitBreaker;
use super::{decode_entry, encode_entry, with_timeout};
use crate::clock::chrono_duration;
use crate::config::{BreakerConfig, TierPolicy};
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::types::TierKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const KEY_PREFIX: &str = "rag-cache:";

/// Byte-level key/value backend with TTL
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local stand-in for a shared cache
///
/// Supports fault injection: it can be taken down, slowed down, or handed
/// corrupt bytes.
#[derive(Debug, Default)]
pub struct InMemoryDistributedBackend {
    data: DashMap<String, (Vec<u8>, Instant)>,
    down: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryDistributedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until [`restore`](Self::restore)
    pub fn shutdown(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Store bytes verbatim under an already-prefixed key
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        self.data
            .insert(key.to_string(), (bytes, Instant::now() + ttl));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data
            .get(key)
            .map(|v| v.1 > Instant::now())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    async fn simulate(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_down() {
            return Err(CacheError::unavailable(
                TierKind::Distributed,
                "connection refused",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedBackend for InMemoryDistributedBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.simulate().await?;
        let expired = match self.data.get(key) {
            Some(item) if item.1 > Instant::now() => return Ok(Some(item.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.simulate().await?;
        self.data
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.simulate().await?;
        self.data.remove(key);
        Ok(())
    }
}

/// Tier2 wrapper: timeout, circuit breaker and entry encoding
pub struct DistributedTier {
    backend: Arc<dyn DistributedBackend>,
    breaker: CircuitBreaker,
    policy: TierPolicy,
    timeout: Duration,
    stale_window: Duration,
}

impl DistributedTier {
    pub fn new(
        backend: Arc<dyn DistributedBackend>,
        policy: TierPolicy,
        timeout: Duration,
        breaker: BreakerConfig,
        stale_window: Duration,
    ) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new("distributed", breaker),
            policy,
            timeout,
            stale_window,
        }
    }

    pub fn storage_key(fingerprint: &str) -> String {
        format!("{}{}", KEY_PREFIX, fingerprint)
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// False while the breaker is open; callers skip the tier entirely
    pub fn is_available(&self) -> bool {
        !self.breaker.is_open()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch an entry
    ///
    /// Undecodable bytes are deleted and reported as `Serialization`.
    pub async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let key = Self::storage_key(fingerprint);
        let bytes = match self.guarded(self.backend.get(&key)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match decode_entry(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Dropping undecodable distributed entry {}: {}", key, e);
                if let Err(del) = self.guarded(self.backend.delete(&key)).await {
                    debug!("Failed to drop undecodable entry {}: {}", key, del);
                }
                Err(e)
            }
        }
    }

    /// Store an entry
    ///
    /// The backend keeps the bytes for the tier's own TTL, and never less than
    /// through the entry's stale window.
    pub async fn put(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Result<()> {
        let key = Self::storage_key(entry.fingerprint());
        let bytes = encode_entry(entry)?;
        let ttl = self.retention(entry, now);
        self.guarded(self.backend.set(&key, bytes, ttl)).await
    }

    pub async fn delete(&self, fingerprint: &str) -> Result<()> {
        let key = Self::storage_key(fingerprint);
        self.guarded(self.backend.delete(&key)).await
    }

    fn retention(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Duration {
        let until = entry.expires_at + chrono_duration(self.stale_window);
        (until - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(self.policy.ttl_with_jitter())
            .max(Duration::from_secs(1))
    }

    /// Run a backend call through the breaker and the timeout
    async fn guarded<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        if !self.breaker.try_acquire() {
            return Err(CacheError::unavailable(
                TierKind::Distributed,
                "circuit breaker open",
            ));
        }

        match with_timeout(TierKind::Distributed, self.timeout, fut).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }
}
