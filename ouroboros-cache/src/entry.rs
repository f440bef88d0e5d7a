//! Cache entry management with TTL support

use crate::clock::chrono_duration;
use crate::key::CacheKey;
use crate::types::{CacheValue, TierKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How an entry relates to its expiry at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Before `expires_at`
    Fresh,
    /// Past `expires_at` but inside the stale-while-revalidate window
    Stale,
    /// Past the stale window
    Expired,
}

/// A cached value with its lifecycle metadata
///
/// Each tier holds its own copy, but `expires_at` is stamped once when the
/// value is written back and every copy carries the same instant. Lower tiers
/// may keep the bytes longer; they never make them fresh again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// The cached value
    pub value: CacheValue,

    /// Tier this copy was produced for or promoted from
    pub tier_of_origin: TierKind,

    /// When the computation that produced the value started
    pub created_at: DateTime<Utc>,

    /// When the entry expires
    pub expires_at: DateTime<Utc>,

    /// Last access time (for LRU tracking)
    pub last_accessed_at: DateTime<Utc>,

    /// Number of times this entry has been accessed
    pub access_count: u64,

    /// Digest of the document versions the value was computed against
    pub source_fingerprint: String,
}

impl CacheEntry {
    /// Create a new cache entry expiring `ttl` after `now`
    pub fn new(
        key: CacheKey,
        value: CacheValue,
        tier_of_origin: TierKind,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let expires_at = (now + chrono_duration(ttl)).max(created_at);
        let source_fingerprint = key.source_fingerprint().to_string();

        Self {
            key,
            value,
            tier_of_origin,
            created_at,
            expires_at,
            last_accessed_at: now,
            access_count: 0,
            source_fingerprint,
        }
    }

    /// Copy for another tier with the same logical expiry
    pub fn promoted(&self, to: TierKind, now: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.tier_of_origin = to;
        copy.last_accessed_at = now;
        copy
    }

    pub fn fingerprint(&self) -> &str {
        self.key.fingerprint()
    }

    /// Check if the entry has expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Classify the entry against its expiry and a stale window
    pub fn freshness(&self, now: DateTime<Utc>, stale_window: Duration) -> Freshness {
        if now < self.expires_at {
            Freshness::Fresh
        } else if now < self.expires_at + chrono_duration(stale_window) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Whether the stored value was computed for the document versions its key names
    pub fn is_consistent_with(&self, key: &CacheKey) -> bool {
        self.key == *key && self.source_fingerprint == key.source_fingerprint()
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self, now: DateTime<Utc>) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
        self.access_count += 1;
    }

    /// Get the age of the entry
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Approximate in-memory size: value bytes plus key text
    pub fn size_bytes(&self) -> usize {
        self.value.len()
            + self.key.fingerprint().len()
            + self.key.query().len()
            + self.source_fingerprint.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKeyBuilder;
    use crate::types::DocumentRef;

    fn key(version: &str) -> CacheKey {
        CacheKeyBuilder::answers("llm-v1")
            .build("what is attention", &[DocumentRef::new("d1", version)])
            .unwrap()
    }

    #[test]
    fn test_cache_entry_creation() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            key("h1"),
            b"answer".to_vec(),
            TierKind::Local,
            now,
            now,
            Duration::from_secs(300),
        );

        assert_eq!(entry.value, b"answer".to_vec());
        assert!(!entry.is_expired(now));
        assert!(entry.expires_at >= entry.created_at);
        assert_eq!(entry.access_count, 0);
        assert_eq!(entry.source_fingerprint, entry.key.source_fingerprint());
    }

    #[test]
    fn test_freshness_windows() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            key("h1"),
            vec![1],
            TierKind::Local,
            now,
            now,
            Duration::from_secs(300),
        );
        let stale_window = Duration::from_secs(30);

        assert_eq!(entry.freshness(now, stale_window), Freshness::Fresh);
        let at = |secs| now + chrono::Duration::seconds(secs);
        assert_eq!(entry.freshness(at(299), stale_window), Freshness::Fresh);
        assert_eq!(entry.freshness(at(300), stale_window), Freshness::Stale);
        assert_eq!(entry.freshness(at(329), stale_window), Freshness::Stale);
        assert_eq!(entry.freshness(at(330), stale_window), Freshness::Expired);
    }

    #[test]
    fn test_promoted_keeps_expiry() {
        let now = Utc::now();
        let source = CacheEntry::new(
            key("h1"),
            vec![1],
            TierKind::Durable,
            now,
            now,
            Duration::from_secs(60),
        );

        let later = now + chrono::Duration::seconds(30);
        let copy = source.promoted(TierKind::Local, later);
        assert_eq!(copy.expires_at, source.expires_at);
        assert_eq!(copy.tier_of_origin, TierKind::Local);
        assert_eq!(copy.created_at, source.created_at);
        assert_eq!(copy.last_accessed_at, later);
    }

    #[test]
    fn test_consistency_check() {
        let now = Utc::now();
        let mut entry = CacheEntry::new(
            key("h1"),
            vec![1],
            TierKind::Distributed,
            now,
            now,
            Duration::from_secs(60),
        );

        assert!(entry.is_consistent_with(&key("h1")));
        assert!(!entry.is_consistent_with(&key("h2")));

        entry.source_fingerprint = "tampered".to_string();
        assert!(!entry.is_consistent_with(&key("h1")));
    }

    #[test]
    fn test_mark_accessed() {
        let now = Utc::now();
        let mut entry = CacheEntry::new(
            key("h1"),
            vec![1],
            TierKind::Local,
            now,
            now,
            Duration::from_secs(3600),
        );

        let later = now + chrono::Duration::milliseconds(10);
        entry.mark_accessed(later);

        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.last_accessed_at, later);
    }

    #[test]
    fn test_time_until_expiration_and_age() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            key("h1"),
            vec![1, 2, 3],
            TierKind::Local,
            now,
            now,
            Duration::from_secs(3600),
        );

        let time_left = entry.time_until_expiration(now);
        assert!(time_left.is_some());
        assert!(time_left.unwrap() <= Duration::from_secs(3600));

        let later = now + chrono::Duration::seconds(10);
        assert_eq!(entry.age(later), Duration::from_secs(10));
        assert!(entry.size_bytes() >= 3);
    }
}
