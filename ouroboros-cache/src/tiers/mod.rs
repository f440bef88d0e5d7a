//! # Storage tiers
//!
//! Three tiers ordered by latency, consulted in order on every lookup:
//!
//! - Tier1 [`LocalTier`]: in-process, bounded, LRU/LFU eviction
//! - Tier2 [`DistributedTier`]: shared network cache behind a circuit breaker
//! - Tier3 [`DurableTier`]: persistent result store, last stop before compute
//!
//! Tier2 and Tier3 talk to pluggable backends ([`DistributedBackend`],
//! [`DurableStore`]) that move opaque bytes; entries cross that boundary as
//! JSON. Every remote call is bounded by a timeout.

pub mod breaker;
pub mod distributed;
pub mod durable;
pub mod local;

pub use breaker::{BreakerState, CircuitBreaker};
pub use distributed::{DistributedBackend, DistributedTier, InMemoryDistributedBackend};
pub use durable::{DurableStore, DurableTier, FileDurableStore, InMemoryDurableStore};
pub use local::{LocalTier, LocalTierStats};

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::types::TierKind;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// The tiers one cache instance writes through
#[derive(Clone)]
pub struct Tiers {
    pub local: Arc<LocalTier>,
    pub distributed: Option<Arc<DistributedTier>>,
    pub durable: Arc<DurableTier>,
}

impl Tiers {
    /// Remove a key from every tier, stopping at the first remote failure
    pub async fn delete_everywhere(&self, fingerprint: &str) -> Result<()> {
        self.local.delete(fingerprint).await;
        if let Some(distributed) = &self.distributed {
            distributed.delete(fingerprint).await?;
        }
        self.durable.delete(fingerprint).await
    }
}

/// Bound a backend call by `timeout`, mapping both failure modes to `TierUnavailable`
pub(crate) async fn with_timeout<T, F>(tier: TierKind, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(CacheError::TierUnavailable { reason, .. })) => {
            Err(CacheError::unavailable(tier, reason))
        }
        Ok(Err(e)) => Err(CacheError::unavailable(tier, e.to_string())),
        Err(_) => Err(CacheError::unavailable(
            tier,
            format!("timed out after {:?}", timeout),
        )),
    }
}

pub(crate) fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(entry)?)
}

pub(crate) fn decode_entry(bytes: &[u8]) -> Result<CacheEntry> {
    Ok(serde_json::from_slice(bytes)?)
}
