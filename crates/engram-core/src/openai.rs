//! OpenAI-compatible capability clients.
//!
//! Works against any endpoint speaking the `/v1/embeddings` and
//! `/v1/chat/completions` wire formats (OpenAI, vLLM, llama.cpp servers).

use async_trait::async_trait;
use engram_store::Episode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::capability::{EmbeddingService, ExtractionService, FactCandidate};
use crate::error::{MemoryError, Result};

const EXTRACTION_SYSTEM_PROMPT: &str = "\
You maintain long-lived user profiles from conversation transcripts. \
Given the numbered episodes below, extract durable facts about the users. \
Respond with ONLY a JSON array; each element must have the keys \
\"user_id\", \"tag\", \"feature\", \"value\", \"confidence\" (0.0-1.0) and \
\"source_episodes\" (array of episode numbers). Return [] when nothing \
durable was said.";

/// Connection settings shared by both clients.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub embedding_model: String,
    pub chat_model: String,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: api_key.into(),
            embedding_model: "text-embedding-3-small".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Read OPENAI_API_KEY (required) and OPENAI_BASE_URL (optional).
    pub fn from_env() -> std::result::Result<Self, String> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| "OPENAI_API_KEY not set")?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        Ok(config)
    }
}

/// Embedding client against `/v1/embeddings`.
#[derive(Clone)]
pub struct OpenAiEmbedding {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiEmbedding {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| MemoryError::Capability("embedding response was empty".to_string()))
    }

    #[instrument(skip_all, fields(count = texts.len()))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&EmbeddingRequest {
                model: &self.config.embedding_model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| MemoryError::Capability(format!("embedding request failed: {e}")))?
            .error_for_status()
            .map_err(|e| MemoryError::Capability(format!("embedding request rejected: {e}")))?;

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::Capability(format!("embedding response malformed: {e}")))?;

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Extraction client against `/v1/chat/completions`.
#[derive(Clone)]
pub struct OpenAiExtraction {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiExtraction {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn render_transcript(episodes: &[Episode]) -> String {
        episodes
            .iter()
            .enumerate()
            .map(|(i, e)| format!("[{i}] {} ({}): {}", e.producer_id, e.episode_type, e.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct WireCandidate {
    user_id: String,
    tag: String,
    feature: String,
    value: serde_json::Value,
    confidence: f64,
    #[serde(default)]
    source_episodes: Vec<usize>,
}

#[async_trait]
impl ExtractionService for OpenAiExtraction {
    #[instrument(skip_all, fields(episodes = episodes.len()))]
    async fn extract(&self, episodes: &[Episode]) -> Result<Vec<FactCandidate>> {
        if episodes.is_empty() {
            return Ok(Vec::new());
        }

        let request = ChatRequest {
            model: &self.config.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACTION_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: Self::render_transcript(episodes),
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Capability(format!("extraction request failed: {e}")))?
            .error_for_status()
            .map_err(|e| MemoryError::Capability(format!("extraction request rejected: {e}")))?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::Capability(format!("extraction response malformed: {e}")))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| MemoryError::Capability("extraction returned no choices".to_string()))?;

        let wire: Vec<WireCandidate> = serde_json::from_str(strip_code_fence(content))
            .map_err(|e| {
                MemoryError::Capability(format!("extraction output was not a JSON array: {e}"))
            })?;

        debug!(candidates = wire.len(), "extraction candidates parsed");

        Ok(wire
            .into_iter()
            .map(|w| FactCandidate {
                user_id: w.user_id,
                tag: w.tag,
                feature: w.feature,
                value: w.value,
                confidence: w.confidence.clamp(0.0, 1.0),
                source_episode_ids: w
                    .source_episodes
                    .iter()
                    .filter_map(|i| episodes.get(*i).map(|e| e.episode_id))
                    .collect::<Vec<Uuid>>(),
            })
            .collect())
    }
}

/// Models often wrap JSON in a markdown code fence despite instructions.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence_variants() {
        assert_eq!(strip_code_fence("[]"), "[]");
        assert_eq!(strip_code_fence("```json\n[]\n```"), "[]");
        assert_eq!(strip_code_fence("```\n[]\n```"), "[]");
    }

    #[test]
    fn test_wire_candidate_parses_without_sources() {
        let wire: Vec<WireCandidate> = serde_json::from_str(
            r#"[{"user_id":"u1","tag":"preference","feature":"contact_channel","value":"email","confidence":0.9}]"#,
        )
        .unwrap();
        assert_eq!(wire.len(), 1);
        assert!(wire[0].source_episodes.is_empty());
    }
}
