//! # Ouroboros Cache (ouroboros-cache)
//!
//! A tiered cache for RAG query results: synthesized answers, retrieved
//! chunks and embeddings computed over a corpus of source documents.
//!
//! ## Features
//!
//! - Three tiers consulted in order: in-process (LRU/LFU), shared network
//!   cache behind a circuit breaker, and a durable result store
//! - Single-flight computation: concurrent misses on one key run the RAG
//!   pipeline once and share the outcome
//! - Document-driven invalidation with a reverse index and per-document
//!   watermarks, so a re-indexed PDF never serves answers computed from its
//!   old text
//! - TTL with jitter per tier, an optional stale-while-revalidate window and
//!   optional negative caching
//! - Predictive refresh of hot keys shortly before they expire
//!
//! ## Keys
//!
//! A [`CacheKey`] is a SHA-256 fingerprint of the artifact kind, model,
//! normalized query and the sorted `(document, version)` pairs the result
//! depends on. A missing version token is an error, never a silent wildcard.
//!
//! ## Example
//!
//! ```no_run
//! use ouroboros_cache::{CacheConfig, CacheKeyBuilder, CacheManager, DocumentRef};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::builder()
//!         .ttl_base(Duration::from_secs(300))
//!         .local_capacity(10_000)
//!         .build();
//!     let cache = CacheManager::init(config)?;
//!
//!     let key = CacheKeyBuilder::answers("llm-v1").build(
//!         "What does the contract say about termination?",
//!         &[DocumentRef::new("contract.pdf", "sha256:9f2c")],
//!     )?;
//!
//!     let answer = cache
//!         .get_or_compute(&key, || async { Ok(b"30 days notice".to_vec()) })
//!         .await?;
//!     println!("{}", String::from_utf8_lossy(&answer));
//!
//!     // contract.pdf was re-uploaded
//!     cache.invalidate("contract.pdf").await;
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod integration;
pub mod invalidation;
pub mod key;
pub mod manager;
pub mod metrics;
pub mod predictor;
pub mod single_flight;
pub mod tiers;
pub mod types;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    BreakerConfig, CacheConfig, CacheConfigBuilder, EvictionStrategy, InvalidationConfig,
    PredictorConfig, PredictorKind, TierPolicy,
};
pub use coordinator::{AnswerSource, ComputeOptions, ComputeResult, Lookup, TieredCacheCoordinator};
pub use entry::{CacheEntry, Freshness};
pub use error::{CacheError, ComputeError, Result};
pub use integration::{CachedAnswer, CachedChunk, CachedEmbedding, RagCache};
pub use invalidation::{
    EventType, InvalidationBus, InvalidationEvent, InvalidationLedger, InvalidationReport,
    ReverseIndex,
};
pub use key::{CacheKey, CacheKeyBuilder};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use metrics::{CacheMetrics, CacheStatsSnapshot, TierStats};
pub use predictor::{AccessPatternRecord, AccessPredictor, AccessTracker, HeuristicPredictor};
#[cfg(feature = "model-predictor")]
pub use predictor::ModelPredictor;
pub use single_flight::{cancel_pair, CancelHandle, CancelToken};
pub use tiers::{
    BreakerState, DistributedBackend, DurableStore, FileDurableStore, InMemoryDistributedBackend,
    InMemoryDurableStore,
};
pub use types::{ArtifactKind, CacheValue, DocumentId, DocumentRef, TierKind};
