//! `MemoryCore`: the single entry point agents talk to.
//!
//! Wires the stores, the capability clients, the extraction pipeline, the
//! retrieval engine and the session coordinator together. Appends are
//! serialized per session; extraction runs in the background once enough
//! appends accumulate and never blocks the append path.

use std::sync::Arc;

use engram_store::{
    Episode, EpisodeDraft, EpisodeStore, ProfileFact, ProfileStore, Scope, StoreError,
};
use tracing::{debug, info, instrument, warn};

use crate::capability::{EmbeddingService, ExtractionService};
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::extraction::{ExtractionOutcome, ExtractionPipeline};
use crate::retrieval::{Retrieval, RetrievalEngine};
use crate::session::{SessionCoordinator, SessionHealth, SessionState};

pub struct MemoryCore {
    episodes: Arc<dyn EpisodeStore>,
    profiles: Arc<dyn ProfileStore>,
    embedder: Arc<dyn EmbeddingService>,
    pipeline: Arc<ExtractionPipeline>,
    retrieval: RetrievalEngine,
    coordinator: Arc<SessionCoordinator>,
    config: MemoryConfig,
}

impl MemoryCore {
    pub fn new(
        episodes: Arc<dyn EpisodeStore>,
        profiles: Arc<dyn ProfileStore>,
        embedder: Arc<dyn EmbeddingService>,
        extractor: Arc<dyn ExtractionService>,
        config: MemoryConfig,
    ) -> Self {
        let pipeline = Arc::new(ExtractionPipeline::new(
            episodes.clone(),
            profiles.clone(),
            extractor,
            embedder.clone(),
            config.extraction.clone(),
            config.merge_policy,
        ));
        let retrieval = RetrievalEngine::new(
            episodes.clone(),
            profiles.clone(),
            embedder.clone(),
            config.retrieval.clone(),
        );
        Self {
            episodes,
            profiles,
            embedder,
            pipeline,
            retrieval,
            coordinator: Arc::new(SessionCoordinator::new()),
            config,
        }
    }

    /// Append one episode to the session, serialized against other appends
    /// in the same session. Schedules a background extraction run once
    /// `message_limit` appends have accumulated.
    #[instrument(skip(self, draft), fields(session = %scope.session_id))]
    pub async fn append_episode(&self, scope: &Scope, mut draft: EpisodeDraft) -> Result<Episode> {
        scope.validate()?;
        let state = self.coordinator.touch(scope);

        if self.config.extraction.embed_on_append && draft.embedding.is_none() {
            match self.embedder.embed(&draft.content).await {
                Ok(vector) => draft.embedding = Some(vector),
                Err(err) => {
                    debug!(error = %err, "append-time embedding failed, storing without vector");
                }
            }
        }

        let episode = {
            let _guard = state.write_lock.lock().await;
            self.episodes.append(scope, draft).await?
        };

        let pending = state.note_append();
        if pending >= self.config.extraction.message_limit && state.try_begin_extraction() {
            self.spawn_extraction(scope.clone(), state.clone());
        }

        Ok(episode)
    }

    /// Hybrid retrieval over the session's episodes and the scoped users'
    /// profiles.
    pub async fn retrieve(&self, scope: &Scope, query: &str, k: usize) -> Result<Retrieval> {
        scope.validate()?;
        self.coordinator.touch(scope);
        self.retrieval.retrieve(scope, query, k).await
    }

    /// Stored profile facts for one user, optionally filtered by tag.
    pub async fn get_profile(
        &self,
        group_id: &str,
        user_id: &str,
        tags: Option<&[String]>,
    ) -> Result<Vec<ProfileFact>> {
        Self::require_profile_ids(group_id, user_id)?;
        Ok(self.profiles.query(group_id, user_id, tags).await?)
    }

    /// Tombstone the session's episodes and reset its coordination state.
    /// Profile facts survive; they belong to the user, not the session.
    #[instrument(skip(self), fields(session = %scope.session_id))]
    pub async fn clear_session(&self, scope: &Scope) -> Result<()> {
        let state = self.coordinator.touch(scope);
        let _guard = state.write_lock.lock().await;
        self.episodes.clear(scope).await?;
        state.reset();
        info!("session cleared");
        Ok(())
    }

    /// Remove every profile fact for the user across the group. Returns the
    /// number of facts removed.
    #[instrument(skip(self))]
    pub async fn purge_user(&self, group_id: &str, user_id: &str) -> Result<u64> {
        Self::require_profile_ids(group_id, user_id)?;
        let removed = self.profiles.purge_user(group_id, user_id).await?;
        info!(removed, "user profile purged");
        Ok(removed)
    }

    /// Run any pending extraction for the session to completion inline.
    /// Waits for an in-flight background run to release the slot first, so
    /// at most one extraction ever runs per session.
    pub async fn flush_extraction(&self, scope: &Scope) -> Result<ExtractionOutcome> {
        scope.validate()?;
        let state = self.coordinator.touch(scope);
        state.acquire_extraction_slot().await;
        let result = self.pipeline.run(scope, state.watermark()).await;
        match &result {
            Ok(outcome) => state.finish_extraction(Some(outcome.new_watermark)),
            Err(_) => state.finish_extraction(None),
        }
        result
    }

    /// Health snapshot for one session, if it has live coordination state.
    pub fn session_health(&self, scope: &Scope) -> Option<SessionHealth> {
        self.coordinator.session_health(scope)
    }

    /// Drop coordination state for idle sessions. Stored data is untouched.
    pub fn evict_idle_sessions(&self) -> usize {
        self.coordinator.evict_idle(self.config.session_idle_timeout.0)
    }

    /// Profile reads and purges take bare ids rather than a scope; enforce
    /// the same requirements a profile-bearing scope would carry.
    fn require_profile_ids(group_id: &str, user_id: &str) -> Result<()> {
        if group_id.is_empty() {
            return Err(StoreError::InvalidScope("group_id is empty".to_string()).into());
        }
        if user_id.is_empty() {
            return Err(StoreError::InvalidScope(
                "profile operations require a user_id".to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn spawn_extraction(&self, scope: Scope, state: Arc<SessionState>) {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let watermark = state.watermark();
            match pipeline.run(&scope, watermark).await {
                Ok(outcome) => {
                    state.finish_extraction(Some(outcome.new_watermark));
                }
                Err(err) => {
                    warn!(error = %err, session = %scope.session_id, "extraction batch parked");
                    state.finish_extraction(None);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ExtractionRule, HashingEmbedder, ScriptedExtractor};
    use crate::config::ExtractionConfig;
    use engram_store::fakes::{MemoryEpisodeStore, MemoryProfileStore};

    fn scope() -> Scope {
        Scope::new("acme", "assistant", "alice", "sess-1")
    }

    fn core_with(extractor: ScriptedExtractor) -> MemoryCore {
        MemoryCore::new(
            Arc::new(MemoryEpisodeStore::new()),
            Arc::new(MemoryProfileStore::new()),
            Arc::new(HashingEmbedder::default()),
            Arc::new(extractor),
            MemoryConfig {
                extraction: ExtractionConfig {
                    base_backoff: std::time::Duration::from_millis(1),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn email_rule() -> ScriptedExtractor {
        ScriptedExtractor::default().with_rule(ExtractionRule::new(
            "prefer email",
            "preference",
            "contact_channel",
            serde_json::json!("email"),
            0.9,
        ))
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_seq() {
        let core = core_with(email_rule());
        let first = core
            .append_episode(&scope(), EpisodeDraft::message("alice", "hello"))
            .await
            .unwrap();
        let second = core
            .append_episode(&scope(), EpisodeDraft::message("alice", "again"))
            .await
            .unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn test_append_embeds_content_when_configured() {
        let core = core_with(email_rule());
        let episode = core
            .append_episode(&scope(), EpisodeDraft::message("alice", "hello"))
            .await
            .unwrap();
        assert!(episode.embedding.is_some());
    }

    #[tokio::test]
    async fn test_flush_extraction_builds_profile() {
        let core = core_with(email_rule());
        core.append_episode(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();

        let outcome = core.flush_extraction(&scope()).await.unwrap();
        assert_eq!(outcome.facts_written, 1);

        let facts = core.get_profile("acme", "alice", None).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].feature, "contact_channel");
    }

    #[tokio::test]
    async fn test_flush_twice_is_idempotent() {
        let core = core_with(email_rule());
        core.append_episode(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();

        let first = core.flush_extraction(&scope()).await.unwrap();
        let second = core.flush_extraction(&scope()).await.unwrap();
        assert_eq!(first.facts_written, 1);
        assert_eq!(second.facts_written, 0, "watermark advanced, nothing to redo");
    }

    #[tokio::test]
    async fn test_clear_session_tombstones_but_keeps_profile() {
        let core = core_with(email_rule());
        core.append_episode(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();
        core.flush_extraction(&scope()).await.unwrap();

        core.clear_session(&scope()).await.unwrap();

        let retrieval = core.retrieve(&scope(), "email", 10).await.unwrap();
        assert!(retrieval
            .candidates
            .iter()
            .all(|c| c.source != crate::retrieval::CandidateSource::Episodic));
        let facts = core.get_profile("acme", "alice", None).await.unwrap();
        assert_eq!(facts.len(), 1, "profile facts outlive the session");
    }

    #[tokio::test]
    async fn test_purge_user_removes_facts() {
        let core = core_with(email_rule());
        core.append_episode(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();
        core.flush_extraction(&scope()).await.unwrap();

        let removed = core.purge_user("acme", "alice").await.unwrap();
        assert_eq!(removed, 1);
        assert!(core.get_profile("acme", "alice", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_finds_appended_episode() {
        let core = core_with(email_rule());
        core.append_episode(&scope(), EpisodeDraft::message("alice", "the launch is on friday"))
            .await
            .unwrap();

        let retrieval = core.retrieve(&scope(), "launch friday", 5).await.unwrap();
        assert!(!retrieval.partial);
        assert!(retrieval.candidates[0].content.contains("launch"));
    }

    #[tokio::test]
    async fn test_profile_reads_require_group_and_user() {
        let core = core_with(email_rule());
        assert!(core.get_profile("acme", "", None).await.is_err());
        assert!(core.get_profile("", "alice", None).await.is_err());

        let err = core.purge_user("acme", "").await.unwrap_err();
        assert!(err.is_caller_error());
    }

    #[tokio::test]
    async fn test_retrieve_rejects_invalid_scope_without_creating_state() {
        let core = core_with(email_rule());
        let mut bad = scope();
        bad.group_id.clear();

        assert!(core.retrieve(&bad, "anything", 5).await.is_err());
        assert!(core.session_health(&bad).is_none());
    }

    #[tokio::test]
    async fn test_session_health_tracks_pending() {
        let core = core_with(email_rule());
        assert!(core.session_health(&scope()).is_none());
        core.append_episode(&scope(), EpisodeDraft::message("alice", "hello"))
            .await
            .unwrap();
        let health = core.session_health(&scope()).unwrap();
        assert_eq!(health.pending_appends, 1);
        assert!(!health.degraded);
    }
}
