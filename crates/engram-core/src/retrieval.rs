//! Hybrid retrieval: episodic search and profile facts blended into one
//! ranked candidate list.
//!
//! Branches fan out concurrently under a per-branch timeout. A branch that
//! misses its deadline (or errors) contributes nothing and flags the result
//! as partial; only both branches failing is an error.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engram_store::{Episode, EpisodeStore, ProfileFact, ProfileStore, Scope};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::capability::EmbeddingService;
use crate::config::RetrievalConfig;
use crate::error::{MemoryError, Result};

/// Which memory the candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Episodic,
    Profile,
}

/// One ranked retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub source: CandidateSource,
    pub id: Uuid,
    pub content: String,
    /// Branch relevance after min-max normalization, in [0, 1].
    pub relevance: f64,
    /// Exponential recency decay, in (0, 1].
    pub recency: f64,
    /// Blended score the ranking is ordered by.
    pub score: f64,
    /// Number of source episodes backing the candidate.
    pub provenance: usize,
    pub updated_at: DateTime<Utc>,
}

/// Ranked candidates plus a degradation flag. `partial` means a branch was
/// dropped (timeout or backend error), never that results were truncated
/// to `k`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Retrieval {
    pub candidates: Vec<Candidate>,
    pub partial: bool,
}

/// Blends the episodic and profile branches into one best-first list.
pub struct RetrievalEngine {
    episodes: Arc<dyn EpisodeStore>,
    profiles: Arc<dyn ProfileStore>,
    embedder: Arc<dyn EmbeddingService>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        episodes: Arc<dyn EpisodeStore>,
        profiles: Arc<dyn ProfileStore>,
        embedder: Arc<dyn EmbeddingService>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            episodes,
            profiles,
            embedder,
            config,
        }
    }

    #[instrument(skip(self), fields(session = %scope.session_id, k))]
    pub async fn retrieve(&self, scope: &Scope, query: &str, k: usize) -> Result<Retrieval> {
        scope.validate()?;
        if k == 0 {
            return Ok(Retrieval::default());
        }

        // Embedding failure degrades to lexical-only search, never fails
        // the call.
        let query_embedding = match self.embedder.embed(query).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                debug!(error = %err, "query embedding failed, lexical search only");
                None
            }
        };

        let episodic_branch = timeout(
            self.config.branch_timeout,
            self.episodes
                .search(scope, query, query_embedding.as_deref(), self.config.branch_fetch),
        );
        let profile_branch = timeout(
            self.config.branch_timeout,
            self.profile_candidates(scope, query, query_embedding.as_deref()),
        );

        let (episodic, profile) = tokio::join!(episodic_branch, profile_branch);

        let mut partial = false;
        let episodic = match episodic {
            Ok(Ok(hits)) => Some(hits),
            Ok(Err(err)) => {
                warn!(error = %err, "episodic branch failed");
                partial = true;
                None
            }
            Err(_) => {
                warn!("episodic branch timed out");
                partial = true;
                None
            }
        };
        let profile = match profile {
            Ok(Ok(hits)) => Some(hits),
            Ok(Err(err)) => {
                warn!(error = %err, "profile branch failed");
                partial = true;
                None
            }
            Err(_) => {
                warn!("profile branch timed out");
                partial = true;
                None
            }
        };

        if episodic.is_none() && profile.is_none() {
            return Err(MemoryError::RetrievalFailed(
                "both retrieval branches failed".to_string(),
            ));
        }

        let now = Utc::now();
        let mut candidates = Vec::new();
        if let Some(hits) = episodic {
            candidates.extend(self.blend_episodic(hits, now));
        }
        if let Some(hits) = profile {
            candidates.extend(self.blend_profile(hits, now));
        }

        candidates.sort_by(|a, b| rank(a, b, self.config.epsilon));
        candidates.truncate(k);

        debug!(candidates = candidates.len(), partial, "retrieval ranked");
        Ok(Retrieval { candidates, partial })
    }

    /// Profile branch: pooled hits across every user in scope. Vector search
    /// when a query embedding exists, otherwise lexical overlap against the
    /// rendered fact text.
    async fn profile_candidates(
        &self,
        scope: &Scope,
        query: &str,
        query_embedding: Option<&[f32]>,
    ) -> Result<Vec<(ProfileFact, f64)>> {
        let mut hits = Vec::new();
        for user_id in &scope.user_ids {
            match query_embedding {
                Some(embedding) => {
                    hits.extend(
                        self.profiles
                            .vector_search(
                                &scope.group_id,
                                user_id,
                                embedding,
                                self.config.branch_fetch,
                            )
                            .await?,
                    );
                }
                None => {
                    // No query vector: score stored facts lexically.
                    for fact in self
                        .profiles
                        .query(&scope.group_id, user_id, None)
                        .await?
                    {
                        let score = engram_store::keyword_overlap(query, &fact_text(&fact));
                        hits.push((fact, score));
                    }
                }
            }
        }
        Ok(hits)
    }

    fn blend_episodic(&self, hits: Vec<(Episode, f64)>, now: DateTime<Utc>) -> Vec<Candidate> {
        let normalized = normalize(hits.iter().map(|(_, s)| *s).collect());
        hits.into_iter()
            .zip(normalized)
            .map(|((episode, _), relevance)| {
                let recency = recency_decay(episode.created_at, now, &self.config);
                Candidate {
                    source: CandidateSource::Episodic,
                    id: episode.episode_id,
                    relevance,
                    recency,
                    score: self.config.w_episodic * relevance + self.config.w_recency * recency,
                    provenance: 1,
                    updated_at: episode.created_at,
                    content: episode.content,
                }
            })
            .collect()
    }

    fn blend_profile(&self, hits: Vec<(ProfileFact, f64)>, now: DateTime<Utc>) -> Vec<Candidate> {
        let normalized = normalize(hits.iter().map(|(_, s)| *s).collect());
        hits.into_iter()
            .zip(normalized)
            .map(|((fact, _), relevance)| {
                let recency = recency_decay(fact.updated_at, now, &self.config);
                Candidate {
                    source: CandidateSource::Profile,
                    id: fact.fact_id,
                    content: fact_text(&fact),
                    relevance,
                    recency,
                    score: self.config.w_profile * relevance + self.config.w_recency * recency,
                    provenance: fact.source_episode_ids.len(),
                    updated_at: fact.updated_at,
                }
            })
            .collect()
    }
}

fn fact_text(fact: &ProfileFact) -> String {
    format!(
        "{}/{}: {}",
        fact.tag,
        fact.feature,
        engram_store::value_text(&fact.value)
    )
}

/// Min-max normalize one branch's raw scores to [0, 1]. A flat branch maps
/// to all-ones (every hit equally relevant) unless the scores are all zero.
fn normalize(scores: Vec<f64>) -> Vec<f64> {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if scores.is_empty() {
        return scores;
    }
    let span = max - min;
    scores
        .into_iter()
        .map(|s| {
            if span > 0.0 {
                (s - min) / span
            } else if max > 0.0 {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

fn recency_decay(at: DateTime<Utc>, now: DateTime<Utc>, config: &RetrievalConfig) -> f64 {
    let age_secs = (now - at).num_milliseconds().max(0) as f64 / 1000.0;
    let half_life = config.recency_half_life.as_secs_f64().max(1.0);
    (-std::f64::consts::LN_2 * age_secs / half_life).exp()
}

/// Best-first ordering. Scores within epsilon are ties and fall through to
/// provenance count, then freshness, then id, so identical inputs always
/// rank identically.
fn rank(a: &Candidate, b: &Candidate, epsilon: f64) -> Ordering {
    if (a.score - b.score).abs() > epsilon {
        return b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal);
    }
    b.provenance
        .cmp(&a.provenance)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.id.cmp(&b.id))
}
