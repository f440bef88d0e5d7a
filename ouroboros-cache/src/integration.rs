//! Typed caching for RAG artifacts
//!
//! [`RagCache`] sits on top of a [`CacheManager`] and stores:
//! - synthesized answers, keyed on query + model + cited document versions
//! - chunk lists, keyed on chunker version + document version
//! - embeddings, keyed on the exact text + embedding model with no document dependency
//!
//! Values are serialized with serde_json. A stored value that no longer
//! decodes (for example after a struct change) is evicted and recomputed once.

use crate::error::{CacheError, ComputeError, Result};
use crate::invalidation::InvalidationReport;
use crate::key::{CacheKey, CacheKeyBuilder};
use crate::manager::CacheManager;
use crate::metrics::CacheStatsSnapshot;
use crate::types::{CacheValue, DocumentRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cached RAG answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    /// The question as asked
    pub query: String,

    /// Synthesized answer text
    pub answer: String,

    /// Documents the answer cites
    pub citations: Vec<DocumentRef>,

    /// Generation time (for metrics)
    pub generated_in_ms: u64,
}

impl CachedAnswer {
    pub fn new(query: impl Into<String>, answer: impl Into<String>, citations: Vec<DocumentRef>) -> Self {
        Self {
            query: query.into(),
            answer: answer.into(),
            citations,
            generated_in_ms: 0,
        }
    }
}

/// Cached context chunk for RAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedChunk {
    /// Unique chunk identifier
    pub chunk_id: String,

    /// The text content
    pub content: String,

    /// Source document ID
    pub document_id: String,

    /// Chunk position in document
    pub position: usize,

    /// Relevance score (if from retrieval)
    pub relevance_score: Option<f64>,

    pub metadata: HashMap<String, String>,
}

/// Cached embedding vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEmbedding {
    pub model: String,
    pub vector: Vec<f32>,
}

impl CachedEmbedding {
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }
}

/// Serialize an artifact into the bytes stored by every tier
pub fn to_cache_value<T: Serialize>(artifact: &T) -> Result<CacheValue> {
    Ok(serde_json::to_vec(artifact)?)
}

/// Inverse of [`to_cache_value`]
pub fn from_cache_value<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(value)?)
}

/// RAG artifact cache wrapper
///
/// Provides typed get-or-compute operations for answers, chunks and
/// embeddings over one shared [`CacheManager`].
pub struct RagCache {
    manager: Arc<CacheManager>,
    answers: CacheKeyBuilder,
    chunks: CacheKeyBuilder,
    embeddings: CacheKeyBuilder,
}

impl RagCache {
    /// `answer_model` and `embedding_model` identify the models producing the
    /// artifacts; `chunker_version` identifies the chunking pipeline.
    pub fn new(
        manager: Arc<CacheManager>,
        answer_model: &str,
        embedding_model: &str,
        chunker_version: &str,
    ) -> Self {
        Self {
            manager,
            answers: CacheKeyBuilder::answers(answer_model),
            chunks: CacheKeyBuilder::chunks(chunker_version),
            embeddings: CacheKeyBuilder::embeddings(embedding_model),
        }
    }

    /// Get the underlying manager
    pub fn inner(&self) -> Arc<CacheManager> {
        self.manager.clone()
    }

    pub fn answer_key(&self, query: &str, documents: &[DocumentRef]) -> Result<CacheKey> {
        self.answers.build(query, documents)
    }

    pub fn chunks_key(&self, document: &DocumentRef) -> Result<CacheKey> {
        self.chunks
            .build(&document.document_id, std::slice::from_ref(document))
    }

    pub fn embedding_key(&self, text: &str) -> Result<CacheKey> {
        self.embeddings.build(text, &[])
    }

    /// Cached answer for `query` over `documents`, computing it on a miss
    pub async fn answer<F, Fut>(
        &self,
        query: &str,
        documents: &[DocumentRef],
        compute: F,
    ) -> Result<CachedAnswer>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<CachedAnswer, ComputeError>>,
    {
        let key = self.answer_key(query, documents)?;
        self.get_or_compute_typed(&key, compute).await
    }

    /// Cached chunk list for one document version
    pub async fn chunks<F, Fut>(&self, document: &DocumentRef, compute: F) -> Result<Vec<CachedChunk>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<CachedChunk>, ComputeError>>,
    {
        let key = self.chunks_key(document)?;
        self.get_or_compute_typed(&key, compute).await
    }

    /// Cached embedding of `text`
    pub async fn embedding<F, Fut>(&self, text: &str, compute: F) -> Result<CachedEmbedding>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<CachedEmbedding, ComputeError>>,
    {
        let key = self.embedding_key(text)?;
        self.get_or_compute_typed(&key, compute).await
    }

    /// Invalidate all answers and chunks for a document
    pub async fn invalidate_document(&self, document_id: &str) -> InvalidationReport {
        self.manager.invalidate(document_id).await
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStatsSnapshot {
        self.manager.stats().await
    }

    async fn get_or_compute_typed<T, F, Fut>(&self, key: &CacheKey, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ComputeError>>,
    {
        let compute = &compute;
        let mut retried = false;

        loop {
            let bytes = self
                .manager
                .get_or_compute(key, move || async move {
                    let artifact = compute().await?;
                    to_cache_value(&artifact)
                        .map_err(|e| ComputeError::permanent(format!("encoding result: {}", e)))
                })
                .await?;

            match from_cache_value::<T>(&bytes) {
                Ok(artifact) => return Ok(artifact),
                Err(e) if !retried => {
                    warn!("Cached value for {} does not decode ({}), recomputing", key, e);
                    retried = true;
                    if let Err(evict) = self.manager.evict(key).await {
                        debug!("Evicting undecodable {} failed: {}", key, evict);
                    }
                }
                Err(e) => {
                    return Err(CacheError::Serialization(format!(
                        "{} still undecodable after recompute: {}",
                        key, e
                    )))
                }
            }
        }
    }
}
