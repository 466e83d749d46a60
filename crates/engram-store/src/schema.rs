//! Record types stored by the Engram backends.
//!
//! Records:
//! - episodes: immutable interaction events, ordered per session
//! - facts: mutable profile facts keyed by (group, user, tag, feature)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Episodes
// ---------------------------------------------------------------------------

/// The kind of episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeType {
    Message,
    Summary,
    Event,
    Thought,
}

impl std::fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Summary => write!(f, "summary"),
            Self::Event => write!(f, "event"),
            Self::Thought => write!(f, "thought"),
        }
    }
}

/// Caller-supplied fields for an episode. Sequence number, id, and timestamp
/// are assigned by the store on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeDraft {
    pub producer_id: String,
    pub produced_for_id: Option<String>,
    pub episode_type: EpisodeType,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
}

impl EpisodeDraft {
    pub fn message(producer_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            producer_id: producer_id.into(),
            produced_for_id: None,
            episode_type: EpisodeType::Message,
            content: content.into(),
            embedding: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn produced_for(mut self, recipient: impl Into<String>) -> Self {
        self.produced_for_id = Some(recipient.into());
        self
    }
}

/// A single immutable interaction event. Created once via append; never
/// mutated afterwards except for the tombstone flag set by `clear`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: Uuid,
    /// Strictly increasing within a session.
    pub seq: u64,
    pub group_id: String,
    pub session_id: String,
    pub producer_id: String,
    pub produced_for_id: Option<String>,
    pub episode_type: EpisodeType,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Profile facts
// ---------------------------------------------------------------------------

/// A superseded fact value retained by the append-history merge policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactVersion {
    pub value: serde_json::Value,
    pub confidence: f64,
    pub source_episode_ids: Vec<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

/// A durable, mergeable structured attribute about a user.
///
/// At most one current fact exists per (group_id, user_id, tag, feature).
/// `version` is the optimistic-concurrency counter used by compare-and-swap
/// upserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileFact {
    pub fact_id: Uuid,
    pub group_id: String,
    pub user_id: String,
    /// Categorical label, e.g. "preference" or "writing_style_email".
    pub tag: String,
    /// Attribute name within the tag.
    pub feature: String,
    pub value: serde_json::Value,
    /// SHA-256 of the canonical JSON value, for duplicate detection.
    pub value_hash: String,
    pub confidence: f64,
    /// Episodes this fact was derived from.
    pub source_episode_ids: Vec<Uuid>,
    pub embedding: Option<Vec<f32>>,
    /// Bounded list of superseded values, newest first.
    pub history: Vec<FactVersion>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileFact {
    /// Merge key string, used by the in-memory backend and logging.
    pub fn merge_key(&self) -> String {
        fact_merge_key(&self.group_id, &self.user_id, &self.tag, &self.feature)
    }
}

/// Render a fact value as plain text: bare string content for JSON strings,
/// compact JSON otherwise. Used wherever fact values meet text matching or
/// embedding, so `"email"` embeds the same as the word `email`.
pub fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Canonical merge key for a fact. Length-prefixed like `Scope::canonical_key`.
pub fn fact_merge_key(group_id: &str, user_id: &str, tag: &str, feature: &str) -> String {
    format!(
        "{}#{}/{}#{}/{}#{}/{}#{}",
        group_id.len(),
        group_id,
        user_id.len(),
        user_id,
        tag.len(),
        tag,
        feature.len(),
        feature
    )
}

/// A proposed fact mutation heading into `ProfileStore::upsert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactProposal {
    pub group_id: String,
    pub user_id: String,
    pub tag: String,
    pub feature: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub source_episode_ids: Vec<Uuid>,
    pub embedding: Option<Vec<f32>>,
}

impl FactProposal {
    /// Content hash of the proposed value (canonical key ordering).
    pub fn value_hash(&self) -> String {
        hash_value(&self.value)
    }
}

/// SHA-256 hex of a JSON value with canonical (sorted) object key ordering.
pub fn hash_value(value: &serde_json::Value) -> String {
    let bytes = if let Some(obj) = value.as_object() {
        let sorted: std::collections::BTreeMap<_, _> = obj.iter().collect();
        serde_json::to_vec(&sorted).unwrap_or_else(|_| value.to_string().into_bytes())
    } else {
        value.to_string().into_bytes()
    };
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_value_is_order_insensitive() {
        let a = serde_json::json!({"x": 1, "y": 2});
        let b = serde_json::json!({"y": 2, "x": 1});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_hash_value_distinguishes_content() {
        let a = serde_json::json!("email");
        let b = serde_json::json!("phone");
        assert_ne!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_merge_key_is_collision_free() {
        // ("a/b", "c") and ("a", "b/c") must not collide on the key string.
        assert_ne!(
            fact_merge_key("g", "a/b", "c", "f"),
            fact_merge_key("g", "a", "b/c", "f")
        );
    }

    #[test]
    fn test_episode_draft_builder() {
        let draft = EpisodeDraft::message("user-1", "hello")
            .produced_for("agent-1")
            .with_embedding(vec![0.1, 0.2]);
        assert_eq!(draft.producer_id, "user-1");
        assert_eq!(draft.produced_for_id.as_deref(), Some("agent-1"));
        assert_eq!(draft.episode_type, EpisodeType::Message);
        assert!(draft.embedding.is_some());
    }
}
