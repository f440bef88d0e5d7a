//! Tiered lookup, single-flight computation and write-back
//!
//! `get_or_compute` walks Tier1 → Tier2 → Tier3. A fresh hit in a lower tier
//! is promoted into the tiers above it. On a full miss exactly one caller per
//! key runs the computation; everyone else waits for its result. A successful
//! result is written Tier3 first, then Tier2, then Tier1, and any single tier
//! failing to accept the write is logged and skipped.
//!
//! Invalidation is authoritative over TTL: an entry created before the last
//! invalidation of one of its documents is never served, and a computation
//! that started before such an invalidation is never written back.

use crate::clock::{chrono_duration, SharedClock};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, Freshness};
use crate::error::{CacheError, ComputeError, Result};
use crate::invalidation::{InvalidationLedger, ReverseIndex};
use crate::key::CacheKey;
use crate::metrics::{CacheMetrics, CacheStatsSnapshot};
use crate::predictor::AccessTracker;
use crate::single_flight::{CancelToken, Role, SingleFlight};
use crate::tiers::Tiers;
use crate::types::{CacheValue, TierKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// What a computation hands back
pub type ComputeResult = std::result::Result<CacheValue, ComputeError>;

/// The RAG pipeline, as seen by background refresh
///
/// Foreground callers pass their own `compute_fn`; predictive refresh has no
/// caller and recomputes through this collaborator instead.
#[async_trait]
pub trait AnswerSource: Send + Sync {
    async fn compute(&self, key: &CacheKey) -> ComputeResult;
}

/// Per-call knobs for `get_or_compute`
#[derive(Debug, Clone, Default)]
pub struct ComputeOptions {
    /// Overrides the configured compute timeout
    pub timeout: Option<Duration>,

    /// Fires cancellation of this caller's wait (and of the computation when
    /// this caller leads it)
    pub cancel: Option<CancelToken>,
}

impl ComputeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Result of a lookup that does not compute
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(CacheEntry),

    /// Past expiry but inside the stale window
    Stale {
        entry: CacheEntry,
        /// A recomputation is running or was just scheduled
        refreshing: bool,
    },

    Miss,
}

impl Lookup {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Lookup::Fresh(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Lookup::Stale { .. })
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss)
    }

    pub fn value(&self) -> Option<&CacheValue> {
        match self {
            Lookup::Fresh(entry) | Lookup::Stale { entry, .. } => Some(&entry.value),
            Lookup::Miss => None,
        }
    }
}

enum Verdict {
    Fresh,
    Stale,
    Expired,
    Reject(&'static str),
}

struct NegativeEntry {
    error: ComputeError,
    created_at: DateTime<Utc>,
    until: DateTime<Utc>,
}

/// Coordinates the three tiers for one cache instance
pub struct TieredCacheCoordinator {
    config: CacheConfig,
    tiers: Tiers,
    clock: SharedClock,
    flights: SingleFlight<CacheValue>,
    index: Arc<ReverseIndex>,
    ledger: Arc<InvalidationLedger>,
    tracker: Arc<AccessTracker>,
    metrics: Arc<CacheMetrics>,
    negative: DashMap<String, NegativeEntry>,
    source: Option<Arc<dyn AnswerSource>>,
    workers: Arc<Semaphore>,
    running: AtomicBool,
}

impl TieredCacheCoordinator {
    pub fn new(
        config: CacheConfig,
        tiers: Tiers,
        clock: SharedClock,
        source: Option<Arc<dyn AnswerSource>>,
    ) -> Self {
        let tracker = Arc::new(AccessTracker::new(config.predictor.clone()));
        let workers = Arc::new(Semaphore::new(config.workers));

        info!(
            "Tiered cache coordinator ready (distributed: {}, predictor: {}, workers: {})",
            tiers.distributed.is_some(),
            tracker.predictor_name(),
            config.workers
        );

        Self {
            config,
            tiers,
            clock,
            flights: SingleFlight::new(),
            index: Arc::new(ReverseIndex::new()),
            ledger: Arc::new(InvalidationLedger::new()),
            tracker,
            metrics: Arc::new(CacheMetrics::new()),
            negative: DashMap::new(),
            source,
            workers,
            running: AtomicBool::new(true),
        }
    }

    /// Return the cached value for `key`, computing it at most once across
    /// concurrent callers
    pub async fn get_or_compute<F, Fut>(self: &Arc<Self>, key: &CacheKey, compute: F) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ComputeResult>,
    {
        self.get_or_compute_with(key, ComputeOptions::default(), compute)
            .await
    }

    pub async fn get_or_compute_with<F, Fut>(
        self: &Arc<Self>,
        key: &CacheKey,
        options: ComputeOptions,
        compute: F,
    ) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ComputeResult>,
    {
        self.ensure_running()?;
        self.metrics.record_request();
        let now = self.clock.now();
        self.tracker.record_access(key.fingerprint(), now);
        let sequence = self.ledger.sequence();

        match self.cascade(key, sequence).await {
            Lookup::Fresh(entry) => {
                self.metrics.record_served_from_cache();
                return Ok(entry.value);
            }
            Lookup::Stale { entry, .. } => {
                self.metrics.record_stale_observed();
                if self.config.serve_stale && self.ensure_refresh(key) {
                    debug!("Serving stale {} while it refreshes", key);
                    self.metrics.record_stale_served();
                    self.metrics.record_served_from_cache();
                    return Ok(entry.value);
                }
            }
            Lookup::Miss => {}
        }

        if let Some(error) = self.negative_hit(key, now) {
            return Err(CacheError::Compute(error));
        }

        self.compute_through_flight(key, options, compute, true)
            .await
    }

    /// Look a key up without computing
    ///
    /// A stale result schedules a background refresh when an
    /// [`AnswerSource`] is configured.
    pub async fn lookup(self: &Arc<Self>, key: &CacheKey) -> Result<Lookup> {
        self.ensure_running()?;
        self.tracker.record_access(key.fingerprint(), self.clock.now());
        let sequence = self.ledger.sequence();

        Ok(match self.cascade(key, sequence).await {
            Lookup::Stale { entry, .. } => {
                self.metrics.record_stale_observed();
                let refreshing = self.ensure_refresh(key);
                Lookup::Stale { entry, refreshing }
            }
            other => other,
        })
    }

    /// Recompute `key` through the answer source, bypassing cached values
    ///
    /// Shares the single-flight path with foreground misses.
    pub async fn refresh(self: &Arc<Self>, key: &CacheKey) -> Result<CacheValue> {
        self.ensure_running()?;
        let source = self.source.clone().ok_or_else(|| {
            CacheError::Config("no answer source configured for refresh".to_string())
        })?;

        let owned = key.clone();
        let result = self
            .compute_through_flight(
                key,
                ComputeOptions::default(),
                move || async move { source.compute(&owned).await },
                false,
            )
            .await;

        if result.is_ok() {
            self.metrics.record_refresh_completed();
        }
        result
    }

    /// Schedule a background refresh; false if one is running or none can start
    pub fn schedule_refresh(self: &Arc<Self>, key: &CacheKey) -> bool {
        if self.source.is_none() || !self.is_running() {
            return false;
        }
        if self.flights.is_in_flight(key.fingerprint()) {
            return false;
        }

        let permit = match Arc::clone(&self.workers).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Worker pool saturated, not refreshing {}", key);
                return false;
            }
        };

        self.metrics.record_refresh_scheduled();
        let this = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match this.refresh(&key).await {
                Ok(_) => debug!("Refreshed {}", key),
                Err(e) => warn!("Background refresh of {} failed: {}", key, e),
            }
        });
        true
    }

    fn ensure_refresh(self: &Arc<Self>, key: &CacheKey) -> bool {
        self.flights.is_in_flight(key.fingerprint()) || self.schedule_refresh(key)
    }

    /// Refresh local entries the predictor expects to be requested again
    ///
    /// Returns the number of refreshes scheduled.
    pub async fn sweep(self: &Arc<Self>) -> usize {
        if !self.is_running() {
            return 0;
        }
        let now = self.clock.now();
        let expiring = self
            .tiers
            .local
            .expiring_within(now, self.tracker.lookahead(), self.config.stale_window)
            .await;
        let candidates = self.tracker.candidates(&expiring, now);

        let mut scheduled = 0;
        for key in &candidates {
            if self.schedule_refresh(key) {
                scheduled += 1;
            }
        }

        let forgotten = self.tracker.gc(now);
        if scheduled > 0 || forgotten > 0 {
            debug!(
                "Predictive sweep: {} expiring, {} candidates, {} scheduled, {} records dropped",
                expiring.len(),
                candidates.len(),
                scheduled,
                forgotten
            );
        }
        scheduled
    }

    /// Drop expired local entries, lapsed negative entries, old watermarks and
    /// keys whose retention has ended in every tier
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let purged = self
            .tiers
            .local
            .purge_expired(now, self.config.stale_window)
            .await;

        self.negative.retain(|_, entry| entry.until > now);

        // no tier can still hold bytes written before this
        let horizon = now - chrono_duration(self.config.retention_horizon());
        self.ledger.prune(horizon);

        let retired = self.index.retire_lapsed(horizon);
        for fingerprint in &retired {
            self.tracker.forget(fingerprint);
            if let Err(e) = self.tiers.durable.delete(fingerprint).await {
                debug!("Dropping retired durable record {} failed: {}", fingerprint, e);
            }
        }
        if !retired.is_empty() {
            debug!("Retired {} keys past their retention", retired.len());
        }

        purged
    }

    /// Register every durable record in the reverse index
    ///
    /// Run once at startup so invalidations reach results written by an
    /// earlier process. Returns the number of keys registered.
    pub async fn restore_index(&self) -> Result<usize> {
        let entries = self.tiers.durable.entries().await?;
        for entry in &entries {
            self.index
                .register(&entry.key, entry.last_accessed_at.max(entry.created_at));
        }
        Ok(entries.len())
    }

    /// Remove `key` from every tier
    pub async fn evict(&self, key: &CacheKey) -> Result<()> {
        self.negative.remove(key.fingerprint());
        self.tiers.delete_everywhere(key.fingerprint()).await
    }

    pub async fn stats(&self) -> CacheStatsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.local_entries = self.tiers.local.len().await;
        snapshot
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.flights.is_in_flight(key.fingerprint())
    }

    pub fn tiers(&self) -> &Tiers {
        &self.tiers
    }

    pub fn index(&self) -> &Arc<ReverseIndex> {
        &self.index
    }

    pub fn ledger(&self) -> &Arc<InvalidationLedger> {
        &self.ledger
    }

    pub fn tracker(&self) -> &Arc<AccessTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Refuse new work
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait until every background refresh has finished
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = self.config.workers as u32;
        match tokio::time::timeout(timeout, self.workers.acquire_many(all)).await {
            Ok(Ok(_permits)) => true,
            _ => false,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CacheError::ShutDown)
        }
    }

    async fn compute_through_flight<F, Fut>(
        &self,
        key: &CacheKey,
        options: ComputeOptions,
        compute: F,
        recheck_local: bool,
    ) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ComputeResult>,
    {
        match self.flights.join(key.fingerprint()) {
            Role::Follower(waiter) => {
                self.metrics.record_contention();
                debug!("Joining in-flight computation for {}", key);
                bounded(waiter.wait(), options.timeout, options.cancel.as_ref()).await
            }
            Role::Leader(guard) => {
                // a flight that finished between our miss and our join already wrote Tier1
                if recheck_local {
                    if let Some(entry) = self.fresh_local(key).await {
                        self.metrics.record_served_from_cache();
                        guard.complete(Ok(entry.value.clone()));
                        return Ok(entry.value);
                    }
                }

                let result = self.lead(key, options, compute).await;
                guard.complete(result.clone());
                result
            }
        }
    }

    async fn lead<F, Fut>(&self, key: &CacheKey, options: ComputeOptions, compute: F) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ComputeResult>,
    {
        let sequence = self.ledger.sequence();
        let started_at = self.clock.now();
        let timeout = options.timeout.or(self.config.compute_timeout);

        debug!("Computing {}", key);
        let result = bounded(
            async { compute().await.map_err(CacheError::Compute) },
            timeout,
            options.cancel.as_ref(),
        )
        .await;
        self.metrics.record_computation(result.is_ok());

        match &result {
            Ok(value) => {
                self.negative.remove(key.fingerprint());
                self.write_back(key, value, started_at, sequence).await;
            }
            Err(CacheError::Compute(error)) => {
                warn!("Computation for {} failed: {}", key, error);
                if let Some(ttl) = self.config.negative_ttl {
                    let now = self.clock.now();
                    self.negative.insert(
                        key.fingerprint().to_string(),
                        NegativeEntry {
                            error: error.clone(),
                            created_at: started_at,
                            until: now + chrono_duration(ttl),
                        },
                    );
                }
            }
            Err(e) => debug!("Computation for {} ended: {}", key, e),
        }
        result
    }

    async fn write_back(
        &self,
        key: &CacheKey,
        value: &CacheValue,
        started_at: DateTime<Utc>,
        sequence: u64,
    ) {
        let fingerprint = key.fingerprint();
        self.index.register(key, self.clock.now());

        if self.ledger.invalidated_since(key, sequence) {
            debug!("Discarding result for {}: a dependency was invalidated mid-computation", key);
            self.metrics.record_discarded_write();
            return;
        }

        let now = self.clock.now();
        // one logical expiry for every copy
        let entry = CacheEntry::new(
            key.clone(),
            value.clone(),
            TierKind::Durable,
            started_at,
            now,
            self.config.freshness_ttl(),
        );

        if let Err(e) = self.tiers.durable.put(&entry).await {
            warn!("Durable write for {} failed: {}", key, e);
            self.metrics.record_write_failure(TierKind::Durable);
        }

        if let Some(distributed) = &self.tiers.distributed {
            if distributed.is_available() {
                let copy = entry.promoted(TierKind::Distributed, now);
                if let Err(e) = distributed.put(&copy, now).await {
                    warn!("Distributed write for {} failed: {}", key, e);
                    self.metrics.record_write_failure(TierKind::Distributed);
                }
            } else {
                debug!("Skipping distributed write for {}: circuit open", key);
            }
        }

        self.tiers
            .local
            .put(entry.promoted(TierKind::Local, now))
            .await;
        self.metrics.clear_possibly_stale(fingerprint);

        // an invalidation may have landed while we were writing
        if self.ledger.invalidated_since(key, sequence) {
            debug!("Retracting result for {}: invalidated during write-back", key);
            self.metrics.record_discarded_write();
            if let Err(e) = self.tiers.delete_everywhere(fingerprint).await {
                warn!("Retracting {} failed: {}", key, e);
                self.metrics.flag_possibly_stale(fingerprint);
            }
        }
    }

    async fn cascade(&self, key: &CacheKey, sequence: u64) -> Lookup {
        let fingerprint = key.fingerprint();
        let now = self.clock.now();
        let mut stale: Option<CacheEntry> = None;

        // Tier1
        let started = Instant::now();
        if let Some(entry) = self.tiers.local.get(fingerprint, now).await {
            match self.classify(&entry, key, now) {
                Verdict::Fresh => {
                    self.metrics.record_hit(TierKind::Local, started.elapsed());
                    debug!("Local hit for {}", key);
                    return Lookup::Fresh(entry);
                }
                Verdict::Stale => stale = Some(entry),
                Verdict::Expired => {
                    self.tiers.local.delete(fingerprint).await;
                }
                Verdict::Reject(reason) => {
                    debug!("Dropping local entry for {}: {}", key, reason);
                    self.tiers.local.delete(fingerprint).await;
                }
            }
        }
        self.metrics.record_miss(TierKind::Local, started.elapsed());

        // Tier2
        if let Some(distributed) = &self.tiers.distributed {
            if distributed.is_available() {
                let started = Instant::now();
                match distributed.get(fingerprint).await {
                    Ok(Some(entry)) => match self.classify(&entry, key, now) {
                        Verdict::Fresh => {
                            self.metrics.record_hit(TierKind::Distributed, started.elapsed());
                            debug!("Distributed hit for {}", key);
                            self.promote(key, &entry, false, sequence).await;
                            return Lookup::Fresh(entry);
                        }
                        verdict => {
                            self.metrics
                                .record_miss(TierKind::Distributed, started.elapsed());
                            self.settle_lower(TierKind::Distributed, key, entry, verdict, &mut stale)
                                .await;
                        }
                    },
                    Ok(None) => {
                        self.metrics
                            .record_miss(TierKind::Distributed, started.elapsed());
                    }
                    Err(e) => {
                        debug!("Distributed lookup for {} failed: {}", key, e);
                        self.metrics.record_tier_error(TierKind::Distributed);
                    }
                }
            } else {
                debug!("Skipping distributed tier for {}: circuit open", key);
            }
        }

        // Tier3
        let started = Instant::now();
        match self.tiers.durable.get(fingerprint).await {
            Ok(Some(entry)) => match self.classify(&entry, key, now) {
                Verdict::Fresh => {
                    self.metrics.record_hit(TierKind::Durable, started.elapsed());
                    debug!("Durable hit for {}", key);
                    self.promote(key, &entry, true, sequence).await;
                    return Lookup::Fresh(entry);
                }
                verdict => {
                    self.metrics.record_miss(TierKind::Durable, started.elapsed());
                    self.settle_lower(TierKind::Durable, key, entry, verdict, &mut stale)
                        .await;
                }
            },
            Ok(None) => self.metrics.record_miss(TierKind::Durable, started.elapsed()),
            Err(e) => {
                debug!("Durable lookup for {} failed: {}", key, e);
                self.metrics.record_tier_error(TierKind::Durable);
            }
        }

        match stale {
            Some(entry) => Lookup::Stale {
                entry,
                refreshing: false,
            },
            None => Lookup::Miss,
        }
    }

    /// Handle a non-fresh entry found in Tier2 or Tier3
    async fn settle_lower(
        &self,
        tier: TierKind,
        key: &CacheKey,
        entry: CacheEntry,
        verdict: Verdict,
        stale: &mut Option<CacheEntry>,
    ) {
        match verdict {
            Verdict::Stale => {
                let newer = stale
                    .as_ref()
                    .map(|current| entry.expires_at > current.expires_at)
                    .unwrap_or(true);
                if newer {
                    *stale = Some(entry);
                }
            }
            Verdict::Reject(reason) => {
                debug!("Dropping {} entry for {}: {}", tier, key, reason);
                let outcome = match tier {
                    TierKind::Distributed => match &self.tiers.distributed {
                        Some(distributed) => distributed.delete(key.fingerprint()).await,
                        None => Ok(()),
                    },
                    TierKind::Durable => self.tiers.durable.delete(key.fingerprint()).await,
                    TierKind::Local => {
                        self.tiers.local.delete(key.fingerprint()).await;
                        Ok(())
                    }
                };
                if let Err(e) = outcome {
                    debug!("Could not drop {} entry for {}: {}", tier, key, e);
                }
            }
            // remote tiers expire on their own
            Verdict::Expired | Verdict::Fresh => {}
        }
    }

    /// Copy a lower-tier hit into the tiers above it
    async fn promote(&self, key: &CacheKey, entry: &CacheEntry, into_distributed: bool, sequence: u64) {
        if self.ledger.invalidated_since(key, sequence) {
            debug!("Not promoting {}: invalidated during lookup", key);
            return;
        }
        let now = self.clock.now();
        self.index.register(key, now);

        if into_distributed {
            if let Some(distributed) = &self.tiers.distributed {
                if distributed.is_available() {
                    let copy = entry.promoted(TierKind::Distributed, now);
                    if let Err(e) = distributed.put(&copy, now).await {
                        debug!("Promotion of {} into distributed tier failed: {}", key, e);
                        self.metrics.record_write_failure(TierKind::Distributed);
                    }
                }
            }
        }

        self.tiers
            .local
            .put(entry.promoted(TierKind::Local, now))
            .await;
    }

    async fn fresh_local(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        let entry = self.tiers.local.peek(key.fingerprint()).await?;
        match self.classify(&entry, key, now) {
            Verdict::Fresh => Some(entry),
            _ => None,
        }
    }

    fn classify(&self, entry: &CacheEntry, key: &CacheKey, now: DateTime<Utc>) -> Verdict {
        if !entry.is_consistent_with(key) {
            return Verdict::Reject("source fingerprint mismatch");
        }
        if self.ledger.invalidated_after(key, entry.created_at) {
            return Verdict::Reject("document invalidated after creation");
        }
        match entry.freshness(now, self.config.stale_window) {
            Freshness::Fresh => Verdict::Fresh,
            Freshness::Stale => Verdict::Stale,
            Freshness::Expired => Verdict::Expired,
        }
    }

    fn negative_hit(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<ComputeError> {
        let cached = self
            .negative
            .get(key.fingerprint())
            .map(|entry| (entry.error.clone(), entry.created_at, entry.until));

        match cached {
            Some((error, created_at, until))
                if now < until && !self.ledger.invalidated_after(key, created_at) =>
            {
                debug!("Negative cache hit for {}", key);
                self.metrics.record_negative_hit();
                Some(error)
            }
            Some(_) => {
                self.negative.remove(key.fingerprint());
                None
            }
            None => None,
        }
    }
}

/// Apply an optional timeout and cancellation token to a computation or wait
async fn bounded<Fut>(
    fut: Fut,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
) -> Result<CacheValue>
where
    Fut: Future<Output = Result<CacheValue>>,
{
    let timed = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Cancelled(format!(
                    "timed out after {:?}",
                    limit
                ))),
            },
            None => fut.await,
        }
    };

    match cancel {
        Some(token) => {
            tokio::select! {
                result = timed => result,
                _ = token.cancelled() => Err(CacheError::Cancelled("cancelled by caller".to_string())),
            }
        }
        None => timed.await,
    }
}
