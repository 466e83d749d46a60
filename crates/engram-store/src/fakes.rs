//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryEpisodeStore` and `MemoryProfileStore` that satisfy the
//! trait contracts without any external dependencies. The profile fake
//! applies merge policies under a single mutex, which gives it the same
//! lost-update-free behavior the SurrealDB backend gets from versioned
//! compare-and-swap.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::merge::{self, MergeDecision, MergePolicy};
use crate::schema::{fact_merge_key, Episode, EpisodeDraft, FactProposal, ProfileFact};
use crate::scope::Scope;
use crate::scoring::{cosine_similarity, keyword_overlap};
use crate::storage_traits::{EpisodeStore, ProfileStore};

// ---------------------------------------------------------------------------
// MemoryEpisodeStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionSlot {
    next_seq: u64,
    episodes: Vec<Episode>,
}

/// In-memory episode store backed by a `HashMap<session_key, Vec<Episode>>`.
#[derive(Debug, Default)]
pub struct MemoryEpisodeStore {
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl MemoryEpisodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total episodes across all sessions, tombstones included.
    pub fn len(&self) -> usize {
        let sessions = self.sessions.lock().unwrap();
        sessions.values().map(|s| s.episodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EpisodeStore for MemoryEpisodeStore {
    async fn append(&self, scope: &Scope, draft: EpisodeDraft) -> StoreResult<Episode> {
        scope.validate()?;
        let mut sessions = self.sessions.lock().unwrap();
        let slot = sessions.entry(scope.canonical_key()).or_default();
        slot.next_seq += 1;
        let episode = Episode {
            episode_id: Uuid::new_v4(),
            seq: slot.next_seq,
            group_id: scope.group_id.clone(),
            session_id: scope.session_id.clone(),
            producer_id: draft.producer_id,
            produced_for_id: draft.produced_for_id,
            episode_type: draft.episode_type,
            content: draft.content,
            embedding: draft.embedding,
            metadata: draft.metadata,
            created_at: Utc::now(),
            deleted: false,
        };
        slot.episodes.push(episode.clone());
        Ok(episode)
    }

    async fn read_recent(
        &self,
        scope: &Scope,
        limit: usize,
        before_seq: Option<u64>,
    ) -> StoreResult<Vec<Episode>> {
        scope.validate()?;
        let sessions = self.sessions.lock().unwrap();
        let mut matches: Vec<Episode> = sessions
            .get(&scope.canonical_key())
            .map(|slot| {
                slot.episodes
                    .iter()
                    .filter(|e| !e.deleted)
                    .filter(|e| before_seq.map(|b| e.seq < b).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by(|a, b| b.seq.cmp(&a.seq));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn read_after(
        &self,
        scope: &Scope,
        after_seq: u64,
        limit: usize,
    ) -> StoreResult<Vec<Episode>> {
        scope.validate()?;
        let sessions = self.sessions.lock().unwrap();
        let mut matches: Vec<Episode> = sessions
            .get(&scope.canonical_key())
            .map(|slot| {
                slot.episodes
                    .iter()
                    .filter(|e| !e.deleted && e.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by(|a, b| a.seq.cmp(&b.seq));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn search(
        &self,
        scope: &Scope,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        k: usize,
    ) -> StoreResult<Vec<(Episode, f64)>> {
        scope.validate()?;
        let sessions = self.sessions.lock().unwrap();
        let mut scored: Vec<(Episode, f64)> = sessions
            .get(&scope.canonical_key())
            .map(|slot| {
                slot.episodes
                    .iter()
                    .filter(|e| !e.deleted)
                    .filter_map(|e| {
                        let score = match (query_embedding, &e.embedding) {
                            (Some(q), Some(emb)) => cosine_similarity(q, emb),
                            _ => keyword_overlap(query_text, &e.content),
                        };
                        (score > 0.0).then(|| (e.clone(), score))
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.seq.cmp(&a.0.seq))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn clear(&self, scope: &Scope) -> StoreResult<()> {
        scope.validate()?;
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(slot) = sessions.get_mut(&scope.canonical_key()) {
            for episode in slot.episodes.iter_mut() {
                episode.deleted = true;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryProfileStore
// ---------------------------------------------------------------------------

/// In-memory profile store backed by a `HashMap<merge_key, ProfileFact>`.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    facts: Mutex<HashMap<String, ProfileFact>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.facts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn upsert(
        &self,
        proposal: FactProposal,
        policy: MergePolicy,
    ) -> StoreResult<ProfileFact> {
        let key = fact_merge_key(
            &proposal.group_id,
            &proposal.user_id,
            &proposal.tag,
            &proposal.feature,
        );
        let mut facts = self.facts.lock().unwrap();
        let existing = facts.get(&key);
        match merge::resolve(existing, &proposal, policy, Utc::now()) {
            MergeDecision::Create(fact) | MergeDecision::Replace(fact) => {
                let mut fact = fact;
                fact.version = existing.map(|f| f.version + 1).unwrap_or(1);
                facts.insert(key, fact.clone());
                Ok(fact)
            }
            MergeDecision::DropMinority => {
                tracing::debug!(
                    tag = %proposal.tag,
                    feature = %proposal.feature,
                    "minority opinion dropped"
                );
                Ok(existing.cloned().expect("minority drop implies existing fact"))
            }
            MergeDecision::Unchanged => {
                Ok(existing.cloned().expect("unchanged implies existing fact"))
            }
            MergeDecision::Ambiguous => Err(StoreError::ConflictUnresolved {
                tag: proposal.tag,
                feature: proposal.feature,
            }),
        }
    }

    async fn query(
        &self,
        group_id: &str,
        user_id: &str,
        tags: Option<&[String]>,
    ) -> StoreResult<Vec<ProfileFact>> {
        let facts = self.facts.lock().unwrap();
        let mut matches: Vec<ProfileFact> = facts
            .values()
            .filter(|f| f.group_id == group_id && f.user_id == user_id)
            .filter(|f| tags.map(|ts| ts.contains(&f.tag)).unwrap_or(true))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.fact_id.cmp(&b.fact_id))
        });
        Ok(matches)
    }

    async fn vector_search(
        &self,
        group_id: &str,
        user_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> StoreResult<Vec<(ProfileFact, f64)>> {
        let facts = self.facts.lock().unwrap();
        let mut scored: Vec<(ProfileFact, f64)> = facts
            .values()
            .filter(|f| f.group_id == group_id && f.user_id == user_id)
            .filter_map(|f| {
                f.embedding
                    .as_ref()
                    .map(|emb| (f.clone(), cosine_similarity(query_embedding, emb)))
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.fact_id.cmp(&b.0.fact_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn purge_user(&self, group_id: &str, user_id: &str) -> StoreResult<u64> {
        let mut facts = self.facts.lock().unwrap();
        let before = facts.len();
        facts.retain(|_, f| !(f.group_id == group_id && f.user_id == user_id));
        Ok((before - facts.len()) as u64)
    }
}
