//! Error types for cache operations
//!
//! Tier-local failures (`TierUnavailable`, `Serialization`) are absorbed by the
//! coordinator. Only `IncompleteFingerprint`, `Compute` and `Cancelled` are
//! returned from `get_or_compute`, since those mean no correct answer exists.

use crate::types::TierKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure reported by the external RAG computation
///
/// Carried verbatim to every waiter of a single-flight group, so it must be
/// cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeError {
    /// Human readable message from the collaborator
    pub message: String,

    /// Whether the collaborator considers the failure transient
    pub retryable: bool,
}

impl ComputeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ComputeError {}

/// Main error type for cache operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// A document reference had no content-version token
    #[error("Incomplete fingerprint: document {document_id} {reason}")]
    IncompleteFingerprint { document_id: String, reason: String },

    /// Tier2/Tier3 call failed or timed out
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: TierKind, reason: String },

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The external RAG computation failed
    #[error("Compute error: {0}")]
    Compute(ComputeError),

    /// Fan-out of an invalidation could not reach a tier
    #[error("Invalidation of {key} on tier {tier} failed after {attempts} attempts")]
    InvalidationDeliveryFailure {
        key: String,
        tier: TierKind,
        attempts: u32,
    },

    /// Computation cancelled, timed out, or its leader went away
    #[error("Computation cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The manager was shut down
    #[error("Cache manager is shut down")]
    ShutDown,

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl CacheError {
    /// Whether this error may be handed back to a `get_or_compute` caller
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            CacheError::IncompleteFingerprint { .. }
                | CacheError::Compute(_)
                | CacheError::Cancelled(_)
                | CacheError::ShutDown
        )
    }

    pub(crate) fn unavailable(tier: TierKind, reason: impl Into<String>) -> Self {
        CacheError::TierUnavailable {
            tier,
            reason: reason.into(),
        }
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<ComputeError> for CacheError {
    fn from(e: ComputeError) -> Self {
        CacheError::Compute(e)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}
