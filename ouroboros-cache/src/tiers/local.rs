//! Tier1: bounded in-process store with LRU or LFU eviction

use crate::clock::chrono_duration;
use crate::config::{EvictionStrategy, TierPolicy};
use crate::entry::CacheEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Counters owned by the local tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalTierStats {
    /// Number of entries currently held
    pub entries: usize,

    /// Total size of cached data in bytes
    pub size_bytes: usize,

    /// Entries evicted because capacity was exceeded
    pub evictions_size: u64,

    /// Entries removed after their stale window passed
    pub evictions_ttl: u64,

    /// Entries removed by invalidation or explicit delete
    pub invalidations: u64,
}

impl LocalTierStats {
    pub fn avg_entry_size(&self) -> usize {
        if self.entries == 0 {
            0
        } else {
            self.size_bytes / self.entries
        }
    }
}

/// In-process tier
///
/// Holds at most `policy.capacity` entries. Eviction runs synchronously inside
/// [`LocalTier::put`]. The store never decides freshness; callers pass `now`
/// and classify entries themselves.
///
/// Lookups only take the read lock. An access is recorded in the slot's
/// atomics, and the eviction order catches up lazily when `put` next needs a
/// victim.
pub struct LocalTier {
    policy: TierPolicy,
    store: Arc<RwLock<LocalStore>>,
}

/// Eviction rank; the smallest rank is evicted first
type Rank = (u64, u64);

struct Slot {
    entry: CacheEntry,

    /// Rank under which the slot currently sits in `order`
    rank: Rank,

    /// Tick of the latest insert or access
    touched: AtomicU64,

    hits: AtomicU64,

    /// Microseconds since the epoch
    last_accessed_us: AtomicI64,
}

impl Slot {
    fn new(entry: CacheEntry, tick: u64, strategy: EvictionStrategy) -> Self {
        let hits = entry.access_count;
        let last_accessed_us = entry.last_accessed_at.timestamp_micros();
        Self {
            entry,
            rank: rank_of(strategy, hits, tick),
            touched: AtomicU64::new(tick),
            hits: AtomicU64::new(hits),
            last_accessed_us: AtomicI64::new(last_accessed_us),
        }
    }

    /// Rank reflecting every access recorded so far
    fn current_rank(&self, strategy: EvictionStrategy) -> Rank {
        rank_of(
            strategy,
            self.hits.load(Ordering::Relaxed),
            self.touched.load(Ordering::Relaxed),
        )
    }

    fn touch(&self, tick: u64, now: DateTime<Utc>) {
        self.touched.fetch_max(tick, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_us
            .fetch_max(now.timestamp_micros(), Ordering::Relaxed);
    }

    /// The entry with its access metadata filled in
    fn snapshot(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        let hits = self.hits.load(Ordering::Relaxed);
        if hits != entry.access_count {
            entry.access_count = hits;
            let micros = self.last_accessed_us.load(Ordering::Relaxed);
            if let Some(at) = DateTime::from_timestamp_micros(micros) {
                entry.last_accessed_at = at;
            }
        }
        entry
    }
}

fn rank_of(strategy: EvictionStrategy, hits: u64, tick: u64) -> Rank {
    match strategy {
        EvictionStrategy::Lru => (0, tick),
        EvictionStrategy::Lfu => (hits, tick),
    }
}

struct LocalStore {
    /// fingerprint -> entry
    entries: HashMap<String, Slot>,

    /// rank -> fingerprint, possibly behind the slots' atomics
    order: BTreeMap<Rank, String>,

    /// Monotonic counter standing in for recency
    tick: AtomicU64,

    stats: LocalTierStats,
}

impl LocalStore {
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(fingerprint)?;
        self.order.remove(&slot.rank);
        self.stats.size_bytes = self.stats.size_bytes.saturating_sub(slot.entry.size_bytes());
        self.stats.entries = self.entries.len();
        Some(slot.snapshot())
    }

    /// Evict lowest-ranked entries until within capacity, never touching `protect`
    ///
    /// A candidate accessed since its rank was written is re-filed under its
    /// current rank instead of being evicted. Readers are excluded while this
    /// runs, so every candidate settles after one re-file.
    fn evict_over(
        &mut self,
        strategy: EvictionStrategy,
        capacity: usize,
        protect: Option<&str>,
    ) -> usize {
        let mut evicted = 0;
        while self.entries.len() > capacity {
            let candidate = self
                .order
                .iter()
                .find(|(_, fp)| Some(fp.as_str()) != protect)
                .map(|(rank, fp)| (*rank, fp.clone()));
            let (rank, fp) = match candidate {
                Some(candidate) => candidate,
                None => break,
            };

            if let Some(slot) = self.entries.get_mut(&fp) {
                let current = slot.current_rank(strategy);
                if current != rank {
                    slot.rank = current;
                    self.order.remove(&rank);
                    self.order.insert(current, fp);
                    continue;
                }
            }

            if self.remove(&fp).is_none() {
                self.order.remove(&rank);
                continue;
            }
            debug!("Evicting local entry over capacity: {}", &fp[..fp.len().min(12)]);
            self.stats.evictions_size += 1;
            evicted += 1;
        }
        evicted
    }
}

impl LocalTier {
    pub fn new(policy: TierPolicy) -> Self {
        info!(
            "Initializing local tier (capacity: {}, ttl: {:?}±{:?}, eviction: {:?})",
            policy.capacity, policy.ttl_base, policy.ttl_jitter, policy.eviction_strategy
        );

        let store = LocalStore {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: AtomicU64::new(0),
            stats: LocalTierStats::default(),
        };

        Self {
            policy,
            store: Arc::new(RwLock::new(store)),
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Get an entry, recording the access for eviction ordering
    pub async fn get(&self, fingerprint: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let store = self.store.read().await;
        let slot = store.entries.get(fingerprint)?;
        slot.touch(store.next_tick(), now);
        Some(slot.snapshot())
    }

    /// Read an entry without touching its access metadata
    pub async fn peek(&self, fingerprint: &str) -> Option<CacheEntry> {
        let store = self.store.read().await;
        store.entries.get(fingerprint).map(Slot::snapshot)
    }

    pub async fn contains(&self, fingerprint: &str) -> bool {
        let store = self.store.read().await;
        store.entries.contains_key(fingerprint)
    }

    /// Insert or replace an entry, then evict down to capacity
    ///
    /// Returns the number of entries evicted.
    pub async fn put(&self, entry: CacheEntry) -> usize {
        let mut store = self.store.write().await;
        let strategy = self.policy.eviction_strategy;
        let fingerprint = entry.fingerprint().to_string();

        if store.remove(&fingerprint).is_some() {
            debug!("Updating local entry: {}", entry.key);
        } else {
            debug!("Inserting local entry: {}", entry.key);
        }

        let slot = Slot::new(entry, store.next_tick(), strategy);
        store.stats.size_bytes += slot.entry.size_bytes();
        store.order.insert(slot.rank, fingerprint.clone());
        store.entries.insert(fingerprint.clone(), slot);
        store.stats.entries = store.entries.len();

        store.evict_over(strategy, self.policy.capacity, Some(&fingerprint))
    }

    /// Remove an entry; returns whether it was present
    pub async fn delete(&self, fingerprint: &str) -> bool {
        let mut store = self.store.write().await;
        let removed = store.remove(fingerprint).is_some();
        if removed {
            store.stats.invalidations += 1;
            debug!("Removed local entry: {}", &fingerprint[..fingerprint.len().min(12)]);
        }
        removed
    }

    /// Evict until the tier is within capacity
    pub async fn evict_if_over_capacity(&self) -> usize {
        let mut store = self.store.write().await;
        store.evict_over(self.policy.eviction_strategy, self.policy.capacity, None)
    }

    /// Entries whose expiry falls inside `(now - grace, now + window]`
    ///
    /// These are the candidates for predictive refresh: about to expire, or
    /// expired but still inside the stale window.
    pub async fn expiring_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        grace: Duration,
    ) -> Vec<CacheEntry> {
        let store = self.store.read().await;
        let upper = now + chrono_duration(window);
        let lower = now - chrono_duration(grace);

        store
            .entries
            .values()
            .filter(|slot| slot.entry.expires_at > lower && slot.entry.expires_at <= upper)
            .map(Slot::snapshot)
            .collect()
    }

    /// Remove entries whose expiry plus `grace` has passed
    pub async fn purge_expired(&self, now: DateTime<Utc>, grace: Duration) -> usize {
        let mut store = self.store.write().await;
        let grace = chrono_duration(grace);

        let expired: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.expires_at + grace <= now)
            .map(|(fp, _)| fp.clone())
            .collect();

        for fp in &expired {
            store.remove(fp);
        }
        store.stats.evictions_ttl += expired.len() as u64;

        if !expired.is_empty() {
            debug!("Purged {} expired local entries", expired.len());
        }
        expired.len()
    }

    /// Clear all entries
    pub async fn clear(&self) -> usize {
        let mut store = self.store.write().await;

        let count = store.entries.len();
        store.entries.clear();
        store.order.clear();
        store.stats.entries = 0;
        store.stats.size_bytes = 0;
        store.stats.invalidations += count as u64;

        info!("Cleared {} entries from local tier", count);
        count
    }

    pub async fn stats(&self) -> LocalTierStats {
        let store = self.store.read().await;
        store.stats.clone()
    }

    pub async fn len(&self) -> usize {
        let store = self.store.read().await;
        store.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        let store = self.store.read().await;
        store.entries.is_empty()
    }
}
