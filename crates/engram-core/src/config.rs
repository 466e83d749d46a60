//! Configuration for the Memory Core.
//!
//! All knobs carry documented defaults; construct with `Default` and adjust
//! the fields that matter for the deployment.

use std::time::Duration;

use engram_store::MergePolicy;
use serde::{Deserialize, Serialize};

/// Retrieval blending and fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Weight of the episodic relevance signal.
    pub w_episodic: f64,
    /// Weight of the profile relevance signal.
    pub w_profile: f64,
    /// Weight of the recency decay signal.
    pub w_recency: f64,
    /// Half-life of the exponential recency decay.
    pub recency_half_life: Duration,
    /// Per-branch fan-out timeout. A branch that misses it degrades the
    /// result to partial instead of failing the call.
    pub branch_timeout: Duration,
    /// Scores closer than this are ties and fall through to the
    /// deterministic tie-break chain.
    pub epsilon: f64,
    /// Candidates fetched per branch before blending.
    pub branch_fetch: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            w_episodic: 0.5,
            w_profile: 0.3,
            w_recency: 0.2,
            recency_half_life: Duration::from_secs(7 * 24 * 3600),
            branch_timeout: Duration::from_secs(5),
            epsilon: 1e-9,
            branch_fetch: 32,
        }
    }
}

/// Extraction batching and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Maximum episodes read per extraction run.
    pub batch_size: usize,
    /// Appends accumulated before an extraction run is scheduled.
    pub message_limit: u64,
    /// Attempts against the extraction capability before the batch is parked.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub base_backoff: Duration,
    /// Embed episode content at append time so episodic search can use
    /// vector similarity.
    pub embed_on_append: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            message_limit: 5,
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            embed_on_append: true,
        }
    }
}

/// Top-level Memory Core configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    /// How profile fact proposals reconcile with existing values.
    pub merge_policy: MergePolicy,
    pub retrieval: RetrievalConfig,
    pub extraction: ExtractionConfig,
    /// Idle time after which a session's coordination state is evicted.
    pub session_idle_timeout: SessionIdleTimeout,
}

/// Newtype so the serialized config reads as seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionIdleTimeout(pub Duration);

impl Default for SessionIdleTimeout {
    fn default() -> Self {
        SessionIdleTimeout(Duration::from_secs(30 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_match_documented_values() {
        let cfg = RetrievalConfig::default();
        assert_eq!(cfg.w_episodic, 0.5);
        assert_eq!(cfg.w_profile, 0.3);
        assert_eq!(cfg.w_recency, 0.2);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = MemoryConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MemoryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.extraction.message_limit, 5);
    }
}
