//! Error taxonomy for the Memory Core.

use engram_store::StoreError;

/// Errors surfaced by the Memory Core.
///
/// Retrieval partiality is deliberately NOT an error: a degraded retrieval
/// returns a flagged `Retrieval` instead of failing the call.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Storage layer error. `InvalidScope` and `ConflictUnresolved`
    /// propagate through this variant with their typing intact.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An external capability (embedding, extraction) failed.
    #[error("capability error: {0}")]
    Capability(String),

    /// Extraction batch parked after exhausting retries. The watermark was
    /// not advanced; new appends are still accepted.
    #[error("extraction failed after {attempts} attempts: {reason}")]
    ExtractionFailed { attempts: u32, reason: String },

    /// Both retrieval branches failed; nothing to return.
    #[error("retrieval failed: {0}")]
    RetrievalFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    /// Caller error (bad scope) vs operational failure.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, MemoryError::Store(StoreError::InvalidScope(_)))
    }
}

/// Result type for Memory Core operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
