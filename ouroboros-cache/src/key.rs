//! Deterministic cache keys for RAG artifacts
//!
//! A key is the SHA-256 of a canonical, length-prefixed encoding of
//! `(artifact kind, model id, query, sorted (document, version) pairs)`.
//! Answer queries are normalized before hashing; embedding and chunk inputs
//! are hashed byte for byte, since case and spacing change what they produce.
//! Re-uploading or re-indexing a document changes its version token and
//! therefore every key that depends on it.

use crate::error::{CacheError, Result};
use crate::types::{ArtifactKind, DocumentId, DocumentRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Fingerprint of a request plus everything needed to recompute it
///
/// Equality and hashing use the fingerprint only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKey {
    fingerprint: String,
    source_fingerprint: String,
    kind: ArtifactKind,
    model: String,
    query: String,
    documents: Vec<DocumentRef>,
}

impl CacheKey {
    /// Hex digest used as the storage key in every tier
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Digest of the document versions alone
    pub fn source_fingerprint(&self) -> &str {
        &self.source_fingerprint
    }

    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Query text as hashed (normalized for answers)
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Sorted, de-duplicated document dependencies
    pub fn documents(&self) -> &[DocumentRef] {
        &self.documents
    }

    pub fn document_ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.documents.iter().map(|d| &d.document_id)
    }

    pub fn depends_on(&self, document_id: &str) -> bool {
        self.documents.iter().any(|d| d.document_id == document_id)
    }

    /// First twelve hex characters, for log lines
    pub fn short(&self) -> &str {
        &self.fingerprint[..self.fingerprint.len().min(12)]
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.short())
    }
}

/// Cache key builder for RAG artifacts
///
/// The builder fixes the artifact kind and model; [`CacheKeyBuilder::build`]
/// is then a pure function of the query and its document references.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    kind: ArtifactKind,
    model: String,
    normalize: bool,
}

impl CacheKeyBuilder {
    /// Create a new cache key builder
    ///
    /// Query normalization is on for answers and off for every other kind.
    pub fn new(kind: ArtifactKind, model: impl Into<String>) -> Self {
        let normalize = kind == ArtifactKind::Answer;
        Self {
            kind,
            model: model.into(),
            normalize,
        }
    }

    /// Override query normalization
    pub fn normalize_queries(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn normalizes_queries(&self) -> bool {
        self.normalize
    }

    pub fn answers(model: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Answer, model)
    }

    pub fn embeddings(model: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Embedding, model)
    }

    pub fn chunks(chunker_version: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Chunk, chunker_version)
    }

    /// Build the cache key
    ///
    /// Fails with [`CacheError::IncompleteFingerprint`] when a reference has no
    /// version token, or when one document appears with two versions.
    pub fn build(&self, query: &str, document_refs: &[DocumentRef]) -> Result<CacheKey> {
        let documents = canonical_documents(document_refs)?;
        let query = if self.normalize {
            normalize_query(query)
        } else {
            query.to_string()
        };
        let source_fingerprint = source_fingerprint(&documents);

        let mut hasher = Sha256::new();
        write_field(&mut hasher, self.kind.to_string().as_bytes());
        write_field(&mut hasher, self.model.as_bytes());
        write_field(&mut hasher, query.as_bytes());
        hasher.update((documents.len() as u64).to_le_bytes());
        for doc in &documents {
            write_field(&mut hasher, doc.document_id.as_bytes());
            write_field(&mut hasher, doc.version.as_bytes());
        }
        let fingerprint = hex::encode(hasher.finalize());

        Ok(CacheKey {
            fingerprint,
            source_fingerprint,
            kind: self.kind.clone(),
            model: self.model.clone(),
            query,
            documents,
        })
    }
}

/// Collapse whitespace runs, trim and lower-case
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Digest of sorted `(document, version)` pairs
pub fn source_fingerprint(documents: &[DocumentRef]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((documents.len() as u64).to_le_bytes());
    for doc in documents {
        write_field(&mut hasher, doc.document_id.as_bytes());
        write_field(&mut hasher, doc.version.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn canonical_documents(document_refs: &[DocumentRef]) -> Result<Vec<DocumentRef>> {
    let mut by_id: BTreeMap<&str, &str> = BTreeMap::new();

    for doc in document_refs {
        let id = doc.document_id.trim();
        if id.is_empty() {
            return Err(CacheError::IncompleteFingerprint {
                document_id: String::new(),
                reason: "has an empty document id".to_string(),
            });
        }
        let version = doc.version.trim();
        if version.is_empty() {
            return Err(CacheError::IncompleteFingerprint {
                document_id: id.to_string(),
                reason: "has no content version token".to_string(),
            });
        }
        if let Some(existing) = by_id.get(id) {
            if *existing != version {
                return Err(CacheError::IncompleteFingerprint {
                    document_id: id.to_string(),
                    reason: format!("is referenced at two versions ({} and {})", existing, version),
                });
            }
            continue;
        }
        by_id.insert(id, version);
    }

    Ok(by_id
        .into_iter()
        .map(|(id, version)| DocumentRef::new(id, version))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(pairs: &[(&str, &str)]) -> Vec<DocumentRef> {
        pairs.iter().map(|(id, v)| DocumentRef::new(*id, *v)).collect()
    }

    #[test]
    fn test_identical_requests_identical_keys() {
        let builder = CacheKeyBuilder::answers("llm-v1");
        let a = builder
            .build("What is  RAG?", &refs(&[("d2", "h2"), ("d1", "h1")]))
            .unwrap();
        let b = builder
            .build("  what is rag? ", &refs(&[("d1", "h1"), ("d2", "h2"), ("d1", "h1")]))
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.query(), "what is rag?");
        assert_eq!(a.documents()[0].document_id, "d1");
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_version_change_changes_key() {
        let builder = CacheKeyBuilder::answers("llm-v1");
        let before = builder.build("q", &refs(&[("d1", "h1")])).unwrap();
        let after = builder.build("q", &refs(&[("d1", "h1-reindexed")])).unwrap();

        assert_ne!(before, after);
        assert_ne!(before.source_fingerprint(), after.source_fingerprint());
    }

    #[test]
    fn test_model_and_kind_participate() {
        let docs = refs(&[("d1", "h1")]);
        let a = CacheKeyBuilder::answers("llm-v1").build("q", &docs).unwrap();
        let b = CacheKeyBuilder::answers("llm-v2").build("q", &docs).unwrap();
        let c = CacheKeyBuilder::embeddings("llm-v1").build("q", &docs).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        // same documents, same source fingerprint
        assert_eq!(a.source_fingerprint(), c.source_fingerprint());
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let builder = CacheKeyBuilder::answers("m");
        let a = builder.build("q", &refs(&[("ab", "c")])).unwrap();
        let b = builder.build("q", &refs(&[("a", "bc")])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_version_is_incomplete() {
        let builder = CacheKeyBuilder::answers("llm-v1");
        let err = builder
            .build("q", &refs(&[("d1", "h1"), ("d2", "  ")]))
            .unwrap_err();

        match err {
            CacheError::IncompleteFingerprint { document_id, .. } => assert_eq!(document_id, "d2"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_versions_are_incomplete() {
        let builder = CacheKeyBuilder::answers("llm-v1");
        let err = builder
            .build("q", &refs(&[("d1", "h1"), ("d1", "h2")]))
            .unwrap_err();
        assert!(matches!(err, CacheError::IncompleteFingerprint { .. }));
    }

    #[test]
    fn test_no_documents_is_allowed() {
        let key = CacheKeyBuilder::embeddings("embed-small")
            .build("hello world", &[])
            .unwrap();
        assert!(key.documents().is_empty());
        assert!(key.to_string().starts_with("embedding:"));
    }

    #[test]
    fn test_embedding_text_is_hashed_verbatim() {
        let builder = CacheKeyBuilder::embeddings("embed-small");
        let upper = builder.build("Apple", &[]).unwrap();
        let lower = builder.build("apple", &[]).unwrap();
        let spaced = builder.build("apple ", &[]).unwrap();

        assert_ne!(upper, lower);
        assert_ne!(lower, spaced);
        assert_eq!(upper.query(), "Apple");

        let chunks = CacheKeyBuilder::chunks("chunker-v1");
        let docs = refs(&[("d1", "h1")]);
        assert_ne!(
            chunks.build("Intro", &docs).unwrap(),
            chunks.build("intro", &docs).unwrap()
        );
    }

    #[test]
    fn test_normalization_override() {
        let builder = CacheKeyBuilder::answers("m").normalize_queries(false);
        assert!(!builder.normalizes_queries());
        assert_ne!(builder.build("Q", &[]).unwrap(), builder.build("q", &[]).unwrap());
        assert!(CacheKeyBuilder::answers("m").normalizes_queries());
    }

    #[test]
    fn test_depends_on() {
        let key = CacheKeyBuilder::answers("m")
            .build("q", &refs(&[("d1", "h1"), ("d2", "h2")]))
            .unwrap();
        assert!(key.depends_on("d1"));
        assert!(!key.depends_on("d3"));
        assert_eq!(key.document_ids().count(), 2);
    }
}
