//! Cache lifecycle: construction, background tasks and shutdown
//!
//! A [`CacheManager`] owns one coordinator, the invalidation bus that shares
//! its reverse index and ledger, and the periodic tasks (predictive sweep,
//! expired-entry cleanup, event listener). It is constructed explicitly and
//! shut down explicitly; nothing here is global.

use crate::clock::{SharedClock, SystemClock};
use crate::config::CacheConfig;
use crate::coordinator::{AnswerSource, ComputeOptions, ComputeResult, Lookup, TieredCacheCoordinator};
use crate::error::{CacheError, Result};
use crate::invalidation::{InvalidationBus, InvalidationEvent, InvalidationReport, ReverseIndex};
use crate::key::CacheKey;
use crate::metrics::CacheStatsSnapshot;
use crate::tiers::{
    DistributedBackend, DistributedTier, DurableStore, DurableTier, InMemoryDurableStore,
    LocalTier, Tiers,
};
use crate::types::CacheValue;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long shutdown waits for background refreshes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Entry point for callers of the cache
pub struct CacheManager {
    coordinator: Arc<TieredCacheCoordinator>,
    bus: Arc<InvalidationBus>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn builder(config: CacheConfig) -> CacheManagerBuilder {
        CacheManagerBuilder::new(config)
    }

    /// Start a manager with in-memory Tier3, no Tier2 and the system clock
    pub fn init(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, compute: F) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ComputeResult>,
    {
        self.coordinator.get_or_compute(key, compute).await
    }

    pub async fn get_or_compute_with<F, Fut>(
        &self,
        key: &CacheKey,
        options: ComputeOptions,
        compute: F,
    ) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ComputeResult>,
    {
        self.coordinator
            .get_or_compute_with(key, options, compute)
            .await
    }

    /// Read through the tiers without computing
    pub async fn lookup(&self, key: &CacheKey) -> Result<Lookup> {
        self.coordinator.lookup(key).await
    }

    /// Recompute `key` through the configured answer source
    pub async fn refresh(&self, key: &CacheKey) -> Result<CacheValue> {
        self.coordinator.refresh(key).await
    }

    /// Invalidate every cached result depending on `document_id`
    ///
    /// When this returns, no lookup will serve a value computed before the
    /// call, even for keys whose delete failed on some tier.
    pub async fn invalidate(&self, document_id: &str) -> InvalidationReport {
        self.bus.invalidate_document(document_id).await
    }

    /// Apply a document service event; redeliveries are ignored
    pub async fn apply_event(&self, event: InvalidationEvent) -> InvalidationReport {
        self.bus.apply(event).await
    }

    pub async fn evict(&self, key: &CacheKey) -> Result<()> {
        self.coordinator.evict(key).await
    }

    /// Run one predictive sweep now; returns refreshes scheduled
    pub async fn sweep_now(&self) -> usize {
        self.coordinator.sweep().await
    }

    /// Run one cleanup pass now; returns local entries purged
    pub async fn cleanup_now(&self) -> usize {
        self.coordinator.cleanup().await
    }

    pub async fn stats(&self) -> CacheStatsSnapshot {
        self.coordinator.stats().await
    }

    /// Keys whose invalidation could not be delivered to every tier
    pub fn possibly_stale_keys(&self) -> Vec<String> {
        self.coordinator.metrics().possibly_stale_keys()
    }

    pub fn in_flight(&self, key: &CacheKey) -> bool {
        self.coordinator.is_in_flight(key)
    }

    pub fn config(&self) -> &CacheConfig {
        self.coordinator.config()
    }

    pub fn coordinator(&self) -> &Arc<TieredCacheCoordinator> {
        &self.coordinator
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }

    /// Stop accepting work, wait for background refreshes and stop the tasks
    pub async fn shutdown(&self) {
        if !self.coordinator.is_running() {
            return;
        }
        info!("Shutting down cache manager");

        self.coordinator.stop();
        let _ = self.shutdown_tx.send(true);

        if !self.coordinator.drain(SHUTDOWN_GRACE).await {
            warn!(
                "Background refreshes still running after {:?}",
                SHUTDOWN_GRACE
            );
        }

        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        info!("Cache manager stopped: {}", self.coordinator.stats().await);
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.coordinator.stop();
        let _ = self.shutdown_tx.send(true);
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

/// Wires backends, clock and collaborators into a [`CacheManager`]
pub struct CacheManagerBuilder {
    config: CacheConfig,
    distributed: Option<Arc<dyn DistributedBackend>>,
    durable: Option<Arc<dyn DurableStore>>,
    clock: Option<SharedClock>,
    source: Option<Arc<dyn AnswerSource>>,
    events: Option<mpsc::Receiver<InvalidationEvent>>,
    background_tasks: bool,
}

impl CacheManagerBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            distributed: None,
            durable: None,
            clock: None,
            source: None,
            events: None,
            background_tasks: true,
        }
    }

    /// Enable Tier2 over this backend
    pub fn distributed(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.distributed = Some(backend);
        self
    }

    pub fn durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Collaborator used by predictive and stale refreshes
    pub fn answer_source(mut self, source: Arc<dyn AnswerSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Consume document mutation events from this channel
    pub fn events(mut self, events: mpsc::Receiver<InvalidationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawn the periodic sweep and cleanup loops (on by default)
    pub fn background_tasks(mut self, enable: bool) -> Self {
        self.background_tasks = enable;
        self
    }

    /// Build the manager; must be called inside a tokio runtime
    pub fn build(self) -> Result<CacheManager> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            CacheError::Config("CacheManager must be built inside a tokio runtime".to_string())
        })?;

        let config = self.config;
        let clock: SharedClock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let distributed = self.distributed.map(|backend| {
            Arc::new(DistributedTier::new(
                backend,
                config.distributed.clone(),
                config.distributed_timeout,
                config.breaker.clone(),
                config.stale_window,
            ))
        });
        let durable_store = self.durable.unwrap_or_else(|| {
            warn!("No durable store configured, Tier3 will not survive restarts");
            Arc::new(InMemoryDurableStore::new())
        });

        let tiers = Tiers {
            local: Arc::new(LocalTier::new(config.local.clone())),
            distributed,
            durable: Arc::new(DurableTier::new(
                durable_store,
                config.durable.clone(),
                config.durable_timeout,
            )),
        };

        let coordinator = Arc::new(TieredCacheCoordinator::new(
            config.clone(),
            tiers.clone(),
            Arc::clone(&clock),
            self.source,
        ));
        let bus = Arc::new(InvalidationBus::new(
            tiers,
            Arc::clone(coordinator.index()),
            Arc::clone(coordinator.ledger()),
            Arc::clone(coordinator.tracker()),
            Arc::clone(coordinator.metrics()),
            clock,
            config.invalidation.clone(),
            config.workers,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // invalidations wait until Tier3 keys from earlier processes are indexed
        coordinator.index().begin_restore();
        tasks.push(runtime.spawn(restore_index(Arc::clone(&coordinator))));

        if let Some(events) = self.events {
            tasks.push(Arc::clone(&bus).spawn_listener(events));
        }
        if self.background_tasks {
            tasks.push(runtime.spawn(sweep_loop(
                Arc::clone(&coordinator),
                config.predictor.sweep_interval,
                shutdown_rx.clone(),
            )));
            if config.enable_auto_cleanup {
                tasks.push(runtime.spawn(cleanup_loop(
                    Arc::clone(&coordinator),
                    config.cleanup_interval,
                    shutdown_rx,
                )));
            }
        }

        info!(
            "Cache manager started (local capacity: {}, {} background tasks)",
            config.local.capacity,
            tasks.len()
        );

        Ok(CacheManager {
            coordinator,
            bus,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Marks the reverse index loaded even if the restore is aborted
struct RestoreGuard(Arc<ReverseIndex>);

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        self.0.finish_restore();
    }
}

/// Rebuild the reverse index from the durable tier
async fn restore_index(coordinator: Arc<TieredCacheCoordinator>) {
    let _guard = RestoreGuard(Arc::clone(coordinator.index()));

    match coordinator.restore_index().await {
        Ok(0) => debug!("Durable tier is empty, nothing to index"),
        Ok(restored) => info!("Indexed {} durable records from earlier runs", restored),
        Err(e) => warn!(
            "Could not index the durable tier, invalidation will not reach records from earlier runs: {}",
            e
        ),
    }
}

/// Periodic predictive refresh
async fn sweep_loop(
    coordinator: Arc<TieredCacheCoordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting predictive sweep task (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        let scheduled = coordinator.sweep().await;
        if scheduled > 0 {
            debug!("Predictive sweep scheduled {} refreshes", scheduled);
        }
    }
}

/// Background task for automatic cache cleanup
async fn cleanup_loop(
    coordinator: Arc<TieredCacheCoordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting automatic cache cleanup task (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        let purged = coordinator.cleanup().await;
        if purged > 0 {
            debug!("Auto cleanup: {} expired entries", purged);
        }
    }
}
