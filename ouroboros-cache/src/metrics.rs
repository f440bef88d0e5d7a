//! Counters for cache performance monitoring

use crate::types::TierKind;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    latency_micros: AtomicU64,
    calls: AtomicU64,
}

impl TierCounters {
    fn observe(&self, elapsed: Duration) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TierStats {
        let calls = self.calls.load(Ordering::Relaxed);
        let total = self.latency_micros.load(Ordering::Relaxed);
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            avg_latency_micros: if calls == 0 { 0 } else { total / calls },
        }
    }
}

/// Live counters shared by the coordinator, tiers and invalidation bus
#[derive(Debug, Default)]
pub struct CacheMetrics {
    tiers: [TierCounters; 3],
    requests: AtomicU64,
    served_from_cache: AtomicU64,
    computations: AtomicU64,
    compute_failures: AtomicU64,
    contended: AtomicU64,
    stale_observed: AtomicU64,
    stale_served: AtomicU64,
    negative_hits: AtomicU64,
    refreshes_scheduled: AtomicU64,
    refreshes_completed: AtomicU64,
    discarded_writes: AtomicU64,
    write_failures: AtomicU64,
    events_applied: AtomicU64,
    duplicate_events: AtomicU64,
    keys_invalidated: AtomicU64,
    possibly_stale: DashSet<String>,
}

fn slot(tier: TierKind) -> usize {
    match tier {
        TierKind::Local => 0,
        TierKind::Distributed => 1,
        TierKind::Durable => 2,
    }
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: TierKind, elapsed: Duration) {
        let counters = &self.tiers[slot(tier)];
        counters.hits.fetch_add(1, Ordering::Relaxed);
        counters.observe(elapsed);
    }

    pub fn record_miss(&self, tier: TierKind, elapsed: Duration) {
        let counters = &self.tiers[slot(tier)];
        counters.misses.fetch_add(1, Ordering::Relaxed);
        counters.observe(elapsed);
    }

    pub fn record_tier_error(&self, tier: TierKind) {
        self.tiers[slot(tier)].errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_served_from_cache(&self) {
        self.served_from_cache.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_computation(&self, ok: bool) {
        self.computations.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.compute_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A caller found a computation already in flight and waited on it
    pub fn record_contention(&self) {
        self.contended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_observed(&self) {
        self.stale_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_scheduled(&self) {
        self.refreshes_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_completed(&self) {
        self.refreshes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A computed value was not written back because a dependency was invalidated meanwhile
    pub fn record_discarded_write(&self) {
        self.discarded_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self, tier: TierKind) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        self.record_tier_error(tier);
    }

    pub fn record_event_applied(&self, keys: usize) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
        self.keys_invalidated
            .fetch_add(keys as u64, Ordering::Relaxed);
    }

    pub fn record_duplicate_event(&self) {
        self.duplicate_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Flag a key whose invalidation could not reach every tier
    pub fn flag_possibly_stale(&self, fingerprint: &str) {
        self.possibly_stale.insert(fingerprint.to_string());
    }

    pub fn clear_possibly_stale(&self, fingerprint: &str) {
        self.possibly_stale.remove(fingerprint);
    }

    pub fn is_possibly_stale(&self, fingerprint: &str) -> bool {
        self.possibly_stale.contains(fingerprint)
    }

    pub fn possibly_stale_keys(&self) -> Vec<String> {
        self.possibly_stale.iter().map(|k| k.key().clone()).collect()
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            local: self.tiers[0].snapshot(),
            distributed: self.tiers[1].snapshot(),
            durable: self.tiers[2].snapshot(),
            requests: load(&self.requests),
            served_from_cache: load(&self.served_from_cache),
            computations: load(&self.computations),
            compute_failures: load(&self.compute_failures),
            contended: load(&self.contended),
            stale_observed: load(&self.stale_observed),
            stale_served: load(&self.stale_served),
            negative_hits: load(&self.negative_hits),
            refreshes_scheduled: load(&self.refreshes_scheduled),
            refreshes_completed: load(&self.refreshes_completed),
            discarded_writes: load(&self.discarded_writes),
            write_failures: load(&self.write_failures),
            events_applied: load(&self.events_applied),
            duplicate_events: load(&self.duplicate_events),
            keys_invalidated: load(&self.keys_invalidated),
            possibly_stale: self.possibly_stale.len(),
            local_entries: 0,
        }
    }
}

/// Per-tier lookup statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub avg_latency_micros: u64,
}

impl TierStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub local: TierStats,
    pub distributed: TierStats,
    pub durable: TierStats,

    /// Calls to `get_or_compute`
    pub requests: u64,

    /// Requests answered from some tier without computing
    pub served_from_cache: u64,

    /// Computations started by a single-flight leader
    pub computations: u64,
    pub compute_failures: u64,

    /// Callers that joined an in-flight computation
    pub contended: u64,

    pub stale_observed: u64,
    pub stale_served: u64,
    pub negative_hits: u64,
    pub refreshes_scheduled: u64,
    pub refreshes_completed: u64,
    pub discarded_writes: u64,
    pub write_failures: u64,
    pub events_applied: u64,
    pub duplicate_events: u64,
    pub keys_invalidated: u64,

    /// Keys whose invalidation failed on some tier
    pub possibly_stale: usize,

    /// Entries currently held by the local tier
    pub local_entries: usize,
}

impl CacheStatsSnapshot {
    /// Share of requests served without computing, as a percentage
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.served_from_cache as f64 / self.requests as f64) * 100.0
        }
    }

    pub fn tier(&self, tier: TierKind) -> &TierStats {
        match tier {
            TierKind::Local => &self.local,
            TierKind::Distributed => &self.distributed,
            TierKind::Durable => &self.durable,
        }
    }
}

impl fmt::Display for CacheStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ requests: {}, hit_rate: {:.2}%, local: {}/{}, distributed: {}/{} ({} errors), durable: {}/{}, computations: {}, contended: {}, stale_served: {}, possibly_stale: {} }}",
            self.requests,
            self.hit_rate(),
            self.local.hits,
            self.local.hits + self.local.misses,
            self.distributed.hits,
            self.distributed.hits + self.distributed.misses,
            self.distributed.errors,
            self.durable.hits,
            self.durable.hits + self.durable.misses,
            self.computations,
            self.contended,
            self.stale_served,
            self.possibly_stale,
        )
    }
}
