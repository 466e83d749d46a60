//! Error types for engram-store

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Scope tuple failed validation (caller error, not retryable)
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// Backend unreachable or failed transiently (retryable)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Merge could not be resolved: equal confidences, differing values
    #[error("unresolved conflict on fact ({tag}, {feature})")]
    ConflictUnresolved { tag: String, feature: String },

    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend rejected the operation (non-transient)
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl StoreError {
    /// Whether a bounded local retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
