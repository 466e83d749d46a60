//! Capability traits consumed by the Memory Core.
//!
//! The concrete LLM provider is a boundary collaborator: the core only needs
//! `embed(text) -> vector` and `extract(episodes) -> fact candidates`.
//! `openai` provides HTTP-backed implementations; the deterministic doubles
//! here back the test suites and offline use.

use async_trait::async_trait;
use engram_store::Episode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;

/// A fact proposed by the extraction capability, attributed to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCandidate {
    pub user_id: String,
    pub tag: String,
    pub feature: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    /// Episodes this candidate was derived from.
    pub source_episode_ids: Vec<Uuid>,
}

/// Text embedding capability.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a single text into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch. Default implementation embeds sequentially.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Fact extraction capability.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Propose fact candidates from an episode batch. An empty result is a
    /// valid outcome (nothing durable was said).
    async fn extract(&self, episodes: &[Episode]) -> Result<Vec<FactCandidate>>;
}

// ---------------------------------------------------------------------------
// Deterministic doubles
// ---------------------------------------------------------------------------

/// Deterministic embedder: hashes word tokens into a fixed-dimension bag
/// vector. Same text always yields the same vector; overlapping vocabulary
/// yields positive cosine similarity. No network, no model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbeddingService for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in text.to_lowercase().split_whitespace() {
            let mut hasher = Sha256::new();
            hasher.update(word.as_bytes());
            let digest = hasher.finalize();
            let bucket = u64::from_le_bytes(
                digest[..8].try_into().unwrap_or([0u8; 8]),
            ) as usize
                % self.dimensions;
            vector[bucket] += 1.0;
        }
        // Normalize so cosine scores stay comparable across text lengths.
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// One rule in a `ScriptedExtractor`: when the trigger substring appears in
/// an episode's content, propose the fact attributed to the producer.
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    pub trigger: String,
    pub tag: String,
    pub feature: String,
    pub value: serde_json::Value,
    pub confidence: f64,
}

impl ExtractionRule {
    pub fn new(
        trigger: impl Into<String>,
        tag: impl Into<String>,
        feature: impl Into<String>,
        value: serde_json::Value,
        confidence: f64,
    ) -> Self {
        Self {
            trigger: trigger.into(),
            tag: tag.into(),
            feature: feature.into(),
            value,
            confidence,
        }
    }
}

/// Rule-table extractor for tests and offline runs. Deterministic: candidates
/// come out in rule order, then episode order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExtractor {
    rules: Vec<ExtractionRule>,
}

impl ScriptedExtractor {
    pub fn new(rules: Vec<ExtractionRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: ExtractionRule) -> Self {
        self.rules.push(rule);
        self
    }
}

#[async_trait]
impl ExtractionService for ScriptedExtractor {
    async fn extract(&self, episodes: &[Episode]) -> Result<Vec<FactCandidate>> {
        let mut candidates = Vec::new();
        for rule in &self.rules {
            for episode in episodes {
                if episode.content.contains(&rule.trigger) {
                    candidates.push(FactCandidate {
                        user_id: episode.producer_id.clone(),
                        tag: rule.tag.clone(),
                        feature: rule.feature.clone(),
                        value: rule.value.clone(),
                        confidence: rule.confidence,
                        source_episode_ids: vec![episode.episode_id],
                    });
                }
            }
        }
        Ok(candidates)
    }
}
