//! Document-driven invalidation
//!
//! When a source document is updated, deleted or re-indexed, every cached key
//! that depends on it must disappear from all tiers. The pieces:
//!
//! - [`ReverseIndex`]: document id to dependent fingerprints, maintained as
//!   keys are written
//! - [`InvalidationLedger`]: per-document watermarks. A computation that
//!   started before a watermark is never written back, and an entry created
//!   before one is never served.
//! - [`InvalidationBus`]: applies [`InvalidationEvent`]s, fans deletes out to
//!   the tiers with retry and backoff, and drops redelivered events

use crate::clock::SharedClock;
use crate::config::InvalidationConfig;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::metrics::CacheMetrics;
use crate::predictor::AccessTracker;
use crate::tiers::Tiers;
use crate::types::{DocumentId, TierKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What happened to the source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Updated,
    Deleted,
    Reindexed,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Updated => write!(f, "updated"),
            EventType::Deleted => write!(f, "deleted"),
            EventType::Reindexed => write!(f, "reindexed"),
        }
    }
}

/// Change notification from the document service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub document_id: DocumentId,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
}

type EventKey = (DocumentId, EventType, DateTime<Utc>);

impl InvalidationEvent {
    pub fn new(
        document_id: impl Into<DocumentId>,
        event_type: EventType,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            event_type,
            occurred_at,
        }
    }

    fn dedup_key(&self) -> EventKey {
        (self.document_id.clone(), self.event_type, self.occurred_at)
    }
}

/// Outcome of applying one event
#[derive(Debug, Clone)]
pub struct InvalidationReport {
    pub document_id: DocumentId,

    /// The event was already applied and was skipped
    pub duplicate: bool,

    /// Keys removed from every tier
    pub keys_invalidated: usize,

    /// Per key and tier delivery failures; those keys are flagged possibly stale
    pub failures: Vec<CacheError>,
}

impl InvalidationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
struct Registration {
    documents: Vec<DocumentId>,
    written_at: DateTime<Utc>,
}

/// Document id to dependent fingerprints
///
/// Each key remembers when a tier last received a copy of it, so keys whose
/// retention has ended everywhere can be retired. While the index is being
/// rebuilt from the durable tier it reports not loaded, and invalidations
/// wait for it.
#[derive(Debug)]
pub struct ReverseIndex {
    by_document: DashMap<DocumentId, HashSet<String>>,
    by_key: DashMap<String, Registration>,
    loaded: watch::Sender<bool>,
}

impl Default for ReverseIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseIndex {
    pub fn new() -> Self {
        let (loaded, _) = watch::channel(true);
        Self {
            by_document: DashMap::new(),
            by_key: DashMap::new(),
            loaded,
        }
    }

    /// Record every document `key` depends on, written to a tier at `written_at`
    pub fn register(&self, key: &CacheKey, written_at: DateTime<Utc>) {
        let fingerprint = key.fingerprint();
        for document_id in key.document_ids() {
            self.by_document
                .entry(document_id.clone())
                .or_default()
                .insert(fingerprint.to_string());
        }
        self.by_key
            .entry(fingerprint.to_string())
            .and_modify(|r| r.written_at = r.written_at.max(written_at))
            .or_insert_with(|| Registration {
                documents: key.document_ids().cloned().collect(),
                written_at,
            });
    }

    /// Fingerprints currently depending on `document_id`
    pub fn keys_for(&self, document_id: &str) -> Vec<String> {
        self.by_document
            .get(document_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a key under every document it was registered for
    pub fn unregister(&self, fingerprint: &str) {
        if let Some((_, registration)) = self.by_key.remove(fingerprint) {
            self.detach(fingerprint, registration.documents);
        }
    }

    /// Forget every key last written before `before`; returns their fingerprints
    ///
    /// A key re-registered concurrently with a newer write time is kept.
    pub fn retire_lapsed(&self, before: DateTime<Utc>) -> Vec<String> {
        let candidates: Vec<String> = self
            .by_key
            .iter()
            .filter(|r| r.written_at < before)
            .map(|r| r.key().clone())
            .collect();

        let mut retired = Vec::with_capacity(candidates.len());
        for fingerprint in candidates {
            if let Some((_, registration)) = self
                .by_key
                .remove_if(&fingerprint, |_, r| r.written_at < before)
            {
                self.detach(&fingerprint, registration.documents);
                retired.push(fingerprint);
            }
        }
        retired
    }

    fn detach(&self, fingerprint: &str, documents: Vec<DocumentId>) {
        for document_id in documents {
            if let Some(mut keys) = self.by_document.get_mut(&document_id) {
                keys.remove(fingerprint);
            }
            self.by_document
                .remove_if(&document_id, |_, keys| keys.is_empty());
        }
    }

    pub fn is_registered(&self, fingerprint: &str) -> bool {
        self.by_key.contains_key(fingerprint)
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Mark the index as incomplete until [`finish_restore`](Self::finish_restore)
    pub fn begin_restore(&self) {
        self.loaded.send_replace(false);
    }

    pub fn finish_restore(&self) {
        self.loaded.send_replace(true);
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Resolves once no restore is in progress
    pub async fn wait_loaded(&self) {
        let mut rx = self.loaded.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|loaded| *loaded).await;
    }
}

/// When a document was last invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

/// Per-document invalidation watermarks
#[derive(Debug, Default)]
pub struct InvalidationLedger {
    sequence: AtomicU64,
    watermarks: DashMap<DocumentId, Watermark>,
}

impl InvalidationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence; capture before a computation starts
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Raise the watermark of `document_id`
    pub fn record(&self, document_id: &str, at: DateTime<Utc>) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.watermarks
            .entry(document_id.to_string())
            .and_modify(|w| {
                w.sequence = sequence;
                w.at = w.at.max(at);
            })
            .or_insert(Watermark { sequence, at });
        sequence
    }

    pub fn watermark(&self, document_id: &str) -> Option<Watermark> {
        self.watermarks.get(document_id).map(|w| *w)
    }

    /// Whether any of `key`'s documents was invalidated after `sequence`
    pub fn invalidated_since(&self, key: &CacheKey, sequence: u64) -> bool {
        key.document_ids().any(|id| {
            self.watermarks
                .get(id)
                .map(|w| w.sequence > sequence)
                .unwrap_or(false)
        })
    }

    /// Whether any of `key`'s documents was invalidated after `created_at`
    pub fn invalidated_after(&self, key: &CacheKey, created_at: DateTime<Utc>) -> bool {
        key.document_ids().any(|id| {
            self.watermarks
                .get(id)
                .map(|w| created_at < w.at)
                .unwrap_or(false)
        })
    }

    /// Drop watermarks older than `before`
    ///
    /// Safe once no tier can hold an entry created before `before`.
    pub fn prune(&self, before: DateTime<Utc>) -> usize {
        let count = self.watermarks.len();
        self.watermarks.retain(|_, w| w.at >= before);
        count.saturating_sub(self.watermarks.len())
    }

    pub fn len(&self) -> usize {
        self.watermarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watermarks.is_empty()
    }
}

/// Bounded set of recently applied events
#[derive(Debug)]
struct RecentEvents {
    capacity: usize,
    order: VecDeque<EventKey>,
    seen: HashSet<EventKey>,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, key: &EventKey) -> bool {
        self.seen.contains(key)
    }

    fn insert(&mut self, key: EventKey) {
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

/// Applies invalidation events to every tier
pub struct InvalidationBus {
    tiers: Tiers,
    index: Arc<ReverseIndex>,
    ledger: Arc<InvalidationLedger>,
    tracker: Arc<AccessTracker>,
    metrics: Arc<CacheMetrics>,
    clock: SharedClock,
    config: InvalidationConfig,
    concurrency: usize,
    recent: Mutex<RecentEvents>,
}

impl InvalidationBus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tiers: Tiers,
        index: Arc<ReverseIndex>,
        ledger: Arc<InvalidationLedger>,
        tracker: Arc<AccessTracker>,
        metrics: Arc<CacheMetrics>,
        clock: SharedClock,
        config: InvalidationConfig,
        concurrency: usize,
    ) -> Self {
        let recent = Mutex::new(RecentEvents::new(config.dedup_capacity));
        Self {
            tiers,
            index,
            ledger,
            tracker,
            metrics,
            clock,
            config,
            concurrency: concurrency.max(1),
            recent,
        }
    }

    /// Apply an event from the document service
    ///
    /// Redelivery of an already applied `(document, type, occurred_at)` is a
    /// no-op.
    pub async fn apply(&self, event: InvalidationEvent) -> InvalidationReport {
        let dedup = event.dedup_key();
        if self.recent_events().contains(&dedup) {
            debug!(
                "Skipping duplicate {} event for document {}",
                event.event_type, event.document_id
            );
            self.metrics.record_duplicate_event();
            return InvalidationReport {
                document_id: event.document_id,
                duplicate: true,
                keys_invalidated: 0,
                failures: Vec::new(),
            };
        }

        let report = self.invalidate_document(&event.document_id).await;
        self.recent_events().insert(dedup);

        info!(
            "Applied {} event for document {}: {} keys invalidated, {} failures",
            event.event_type,
            event.document_id,
            report.keys_invalidated,
            report.failures.len()
        );
        report
    }

    /// Invalidate every key depending on `document_id`, without deduplication
    pub async fn invalidate_document(&self, document_id: &str) -> InvalidationReport {
        // raise the watermark before deleting so in-flight computations skip write-back
        self.ledger.record(document_id, self.clock.now());
        if !self.index.is_loaded() {
            debug!("Waiting for the reverse index restore before invalidating {}", document_id);
            self.index.wait_loaded().await;
        }

        let keys = self.index.keys_for(document_id);
        let results: Vec<(String, Vec<CacheError>)> = stream::iter(keys)
            .map(|fingerprint| async move {
                let failures = self.purge_key(&fingerprint).await;
                (fingerprint, failures)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = InvalidationReport {
            document_id: document_id.to_string(),
            duplicate: false,
            keys_invalidated: 0,
            failures: Vec::new(),
        };

        for (fingerprint, failures) in results {
            if failures.is_empty() {
                self.index.unregister(&fingerprint);
                self.tracker.forget(&fingerprint);
                self.metrics.clear_possibly_stale(&fingerprint);
                report.keys_invalidated += 1;
            } else {
                self.metrics.flag_possibly_stale(&fingerprint);
                report.failures.extend(failures);
            }
        }

        self.metrics.record_event_applied(report.keys_invalidated);
        report
    }

    /// Delete one key from every tier
    async fn purge_key(&self, fingerprint: &str) -> Vec<CacheError> {
        let mut failures = Vec::new();

        self.tiers.local.delete(fingerprint).await;

        if let Some(distributed) = &self.tiers.distributed {
            let outcome = self
                .with_retry(TierKind::Distributed, fingerprint, || {
                    distributed.delete(fingerprint)
                })
                .await;
            if let Err(e) = outcome {
                failures.push(e);
            }
        }

        let durable = &self.tiers.durable;
        if let Err(e) = self
            .with_retry(TierKind::Durable, fingerprint, || durable.delete(fingerprint))
            .await
        {
            failures.push(e);
        }

        failures
    }

    async fn with_retry<F, Fut>(&self, tier: TierKind, fingerprint: &str, op: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempts > self.config.max_retries => {
                    let failure = CacheError::InvalidationDeliveryFailure {
                        key: fingerprint.to_string(),
                        tier,
                        attempts,
                    };
                    warn!("{} (last error: {})", failure, e);
                    return Err(failure);
                }
                Err(e) => {
                    let delay = self
                        .config
                        .base_backoff
                        .saturating_mul(2u32.saturating_pow(attempts - 1));
                    debug!(
                        "Invalidation delete on {} failed (attempt {}): {}; retrying in {:?}",
                        tier, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Consume an event stream until it closes
    pub fn spawn_listener(self: Arc<Self>, mut events: mpsc::Receiver<InvalidationEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Invalidation listener started");
            while let Some(event) = events.recv().await {
                let report = self.apply(event).await;
                if !report.is_complete() {
                    warn!(
                        "Invalidation of document {} incomplete: {} tier deliveries failed",
                        report.document_id,
                        report.failures.len()
                    );
                }
            }
            info!("Invalidation event stream closed");
        })
    }

    pub fn ledger(&self) -> &Arc<InvalidationLedger> {
        &self.ledger
    }

    pub fn index(&self) -> &Arc<ReverseIndex> {
        &self.index
    }

    fn recent_events(&self) -> std::sync::MutexGuard<'_, RecentEvents> {
        self.recent.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKeyBuilder;
    use crate::types::DocumentRef;

    fn key(query: &str, docs: &[(&str, &str)]) -> CacheKey {
        let refs: Vec<DocumentRef> = docs.iter().map(|(d, v)| DocumentRef::new(*d, *v)).collect();
        CacheKeyBuilder::answers("m").build(query, &refs).unwrap()
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::Updated.to_string(), "updated");
        assert_eq!(EventType::Reindexed.to_string(), "reindexed");
    }

    #[test]
    fn test_reverse_index_register_and_unregister() {
        let index = ReverseIndex::new();
        let shared = key("q1", &[("d1", "h1"), ("d2", "h2")]);
        let single = key("q2", &[("d1", "h1")]);
        let now = Utc::now();

        index.register(&shared, now);
        index.register(&single, now);
        index.register(&single, now);

        assert_eq!(index.keys_for("d1").len(), 2);
        assert_eq!(index.keys_for("d2"), vec![shared.fingerprint().to_string()]);
        assert_eq!(index.len(), 2);

        index.unregister(shared.fingerprint());
        assert!(index.keys_for("d2").is_empty());
        assert_eq!(index.keys_for("d1"), vec![single.fingerprint().to_string()]);
        assert!(!index.is_registered(shared.fingerprint()));
    }

    #[test]
    fn test_retire_lapsed_keeps_recent_writes() {
        let index = ReverseIndex::new();
        let old = key("q1", &[("d1", "h1")]);
        let rewritten = key("q2", &[("d1", "h1")]);
        let t0 = Utc::now();
        let later = t0 + chrono::Duration::seconds(120);

        index.register(&old, t0);
        index.register(&rewritten, t0);
        index.register(&rewritten, later);

        let retired = index.retire_lapsed(t0 + chrono::Duration::seconds(60));
        assert_eq!(retired, vec![old.fingerprint().to_string()]);
        assert_eq!(index.keys_for("d1"), vec![rewritten.fingerprint().to_string()]);

        assert_eq!(index.retire_lapsed(later + chrono::Duration::seconds(1)).len(), 1);
        assert!(index.is_empty());
        assert!(index.keys_for("d1").is_empty());
    }

    #[tokio::test]
    async fn test_restore_gate() {
        let index = Arc::new(ReverseIndex::new());
        assert!(index.is_loaded());
        index.wait_loaded().await;

        index.begin_restore();
        assert!(!index.is_loaded());
        let waiting = Arc::clone(&index);
        let waiter = tokio::spawn(async move { waiting.wait_loaded().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        index.finish_restore();
        waiter.await.unwrap();
    }

    #[test]
    fn test_ledger_watermarks() {
        let ledger = InvalidationLedger::new();
        let k = key("q", &[("d1", "h1"), ("d2", "h2")]);
        let t0 = Utc::now();

        let before = ledger.sequence();
        assert!(!ledger.invalidated_since(&k, before));

        ledger.record("d2", t0);
        assert!(ledger.invalidated_since(&k, before));
        assert!(!ledger.invalidated_since(&k, ledger.sequence()));

        assert!(ledger.invalidated_after(&k, t0 - chrono::Duration::seconds(1)));
        assert!(!ledger.invalidated_after(&k, t0));

        assert_eq!(ledger.prune(t0 + chrono::Duration::seconds(1)), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_recent_events_bounded() {
        let t0 = Utc::now();
        let mut recent = RecentEvents::new(2);
        let a = ("d1".to_string(), EventType::Updated, t0);
        let b = ("d2".to_string(), EventType::Updated, t0);
        let c = ("d3".to_string(), EventType::Deleted, t0);

        recent.insert(a.clone());
        recent.insert(a.clone());
        recent.insert(b.clone());
        assert!(recent.contains(&a));

        recent.insert(c.clone());
        assert!(!recent.contains(&a));
        assert!(recent.contains(&b));
        assert!(recent.contains(&c));
    }
}
