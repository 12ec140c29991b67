//! ============================================================================
//! Memory Errors - Typed failures for the companion memory layer
//! ============================================================================
//! Upstream variants (history, vector index, embeddings, timeouts) are
//! kept apart from caller mistakes so callers can tell "nothing found" from
//! "service down" and decide whether to retry.
//! ============================================================================

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the memory manager and its collaborators
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Companion key is missing its user identity
    #[error("Companion key set incorrectly: {0}")]
    InvalidKey(String),

    /// Required configuration value missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sorted-set history store failure
    #[error("History store error: {0}")]
    History(String),

    /// Vector index failure (query or upsert)
    #[error("Vector index error: {0}")]
    VectorIndex(String),

    /// Embedding API failure
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Embedding API answered but the vector is unusable
    #[error("Invalid embedding vector: {0}")]
    InvalidEmbedding(String),

    /// An upstream call exceeded the configured deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Embedded catalog database failure
    #[error("Catalog database error: {0}")]
    Catalog(String),
}

impl MemoryError {
    /// True when the failure came from an external service and may succeed on retry
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            MemoryError::History(_)
                | MemoryError::VectorIndex(_)
                | MemoryError::Embedding(_)
                | MemoryError::InvalidEmbedding(_)
                | MemoryError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
