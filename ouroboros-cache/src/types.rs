//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache value type - opaque serialized bytes produced by the RAG subsystem
pub type CacheValue = Vec<u8>;

/// Identifier of a source document (PDF) as known to the document service
pub type DocumentId = String;

/// A document dependency together with the content version it was read at
///
/// The version token is usually the content hash of the extracted text or the
/// index generation; any change to it must produce a different cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_id: DocumentId,
    pub version: String,
}

impl DocumentRef {
    pub fn new(document_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.document_id, self.version)
    }
}

/// Cache tier in the lookup cascade, ordered by increasing latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Tier1: in-process store
    Local,

    /// Tier2: shared network cache
    Distributed,

    /// Tier3: persistent result store
    Durable,
}

impl TierKind {
    pub const ALL: [TierKind; 3] = [TierKind::Local, TierKind::Distributed, TierKind::Durable];
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Local => write!(f, "local"),
            TierKind::Distributed => write!(f, "distributed"),
            TierKind::Durable => write!(f, "durable"),
        }
    }
}

/// Kind of artifact a key addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Synthesized RAG answer
    Answer,

    /// Text chunk extracted from a document
    Chunk,

    /// Embedding vector
    Embedding,

    /// Custom artifact type
    Custom(String),
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Answer => write!(f, "answer"),
            ArtifactKind::Chunk => write!(f, "chunk"),
            ArtifactKind::Embedding => write!(f, "embedding"),
            ArtifactKind::Custom(s) => write!(f, "custom:{}", s),
        }
    }
}
