//! Extraction pipeline: turns freshly appended episodes into profile facts.
//!
//! Runs per session, batched above a watermark. The watermark only advances
//! after the whole batch has been merged, so an aborted run is retried from
//! the same position and idempotent upserts make the replay harmless.

use std::sync::Arc;

use engram_store::{EpisodeStore, FactProposal, MergePolicy, ProfileStore, Scope, StoreError};
use tracing::{debug, info, instrument, warn};

use crate::capability::{EmbeddingService, ExtractionService, FactCandidate};
use crate::config::ExtractionConfig;
use crate::error::{MemoryError, Result};
use crate::retry::{with_backoff, BackoffPolicy};

/// What a single extraction run did.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    /// Highest episode seq incorporated by this run. Equal to the input
    /// watermark when there was nothing to do.
    pub new_watermark: u64,
    /// Candidates merged into the profile store.
    pub facts_written: usize,
    /// Merge keys that hit an unresolvable conflict (Reject policy, equal
    /// confidences). Surfaced for disambiguation, not retried.
    pub conflicts: Vec<(String, String)>,
}

/// Extraction pipeline over the two stores and the extraction capability.
pub struct ExtractionPipeline {
    episodes: Arc<dyn EpisodeStore>,
    profiles: Arc<dyn ProfileStore>,
    extractor: Arc<dyn ExtractionService>,
    embedder: Arc<dyn EmbeddingService>,
    config: ExtractionConfig,
    merge_policy: MergePolicy,
}

impl ExtractionPipeline {
    pub fn new(
        episodes: Arc<dyn EpisodeStore>,
        profiles: Arc<dyn ProfileStore>,
        extractor: Arc<dyn ExtractionService>,
        embedder: Arc<dyn EmbeddingService>,
        config: ExtractionConfig,
        merge_policy: MergePolicy,
    ) -> Self {
        Self {
            episodes,
            profiles,
            extractor,
            embedder,
            config,
            merge_policy,
        }
    }

    /// Run one extraction batch for the session above `watermark`.
    ///
    /// Transient store failures and exhausted capability retries abort the
    /// batch with the watermark unchanged; the caller parks the batch and
    /// marks the session degraded. Appends are never blocked by this path.
    #[instrument(skip(self), fields(session = %scope.session_id, watermark))]
    pub async fn run(&self, scope: &Scope, watermark: u64) -> Result<ExtractionOutcome> {
        // Writes profile facts, so the scope must name at least one user.
        scope.validate_for_profile()?;

        let batch = self
            .episodes
            .read_after(scope, watermark, self.config.batch_size)
            .await?;

        if batch.is_empty() {
            debug!("nothing above the watermark");
            return Ok(ExtractionOutcome {
                new_watermark: watermark,
                ..Default::default()
            });
        }

        let batch_high = batch.iter().map(|e| e.seq).max().unwrap_or(watermark);

        let policy = BackoffPolicy::new(self.config.max_attempts, self.config.base_backoff);
        let candidates = with_backoff(
            policy,
            |err: &MemoryError| matches!(err, MemoryError::Capability(_)),
            || self.extractor.extract(&batch),
        )
        .await
        .map_err(|err| MemoryError::ExtractionFailed {
            attempts: self.config.max_attempts,
            reason: err.to_string(),
        })?;

        debug!(candidates = candidates.len(), "extraction produced candidates");

        let mut outcome = ExtractionOutcome {
            new_watermark: batch_high,
            ..Default::default()
        };

        for candidate in candidates {
            let proposal = self.to_proposal(scope, candidate).await;
            let written = with_backoff(
                policy,
                |err: &StoreError| err.is_transient(),
                || self.profiles.upsert(proposal.clone(), self.merge_policy),
            )
            .await;
            match written {
                Ok(_) => outcome.facts_written += 1,
                Err(StoreError::ConflictUnresolved { tag, feature }) => {
                    warn!(%tag, %feature, "fact conflict needs disambiguation");
                    outcome.conflicts.push((tag, feature));
                }
                // Anything else aborts the batch before the watermark moves.
                Err(err) => return Err(err.into()),
            }
        }

        info!(
            facts = outcome.facts_written,
            conflicts = outcome.conflicts.len(),
            new_watermark = outcome.new_watermark,
            "extraction batch committed"
        );
        Ok(outcome)
    }

    /// Build the store proposal, embedding the fact text when possible.
    /// An embedding failure degrades to a no-embedding fact rather than
    /// failing the batch.
    async fn to_proposal(&self, scope: &Scope, candidate: FactCandidate) -> FactProposal {
        let text = format!(
            "{} {}: {}",
            candidate.tag,
            candidate.feature,
            engram_store::value_text(&candidate.value)
        );
        let embedding = match self.embedder.embed(&text).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                debug!(error = %err, "fact embedding failed, storing without vector");
                None
            }
        };

        FactProposal {
            group_id: scope.group_id.clone(),
            user_id: candidate.user_id,
            tag: candidate.tag,
            feature: candidate.feature,
            value: candidate.value,
            confidence: candidate.confidence,
            source_episode_ids: candidate.source_episode_ids,
            embedding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ExtractionRule, HashingEmbedder, ScriptedExtractor};
    use async_trait::async_trait;
    use engram_store::fakes::{MemoryEpisodeStore, MemoryProfileStore};
    use engram_store::{Episode, EpisodeDraft};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scope() -> Scope {
        Scope::new("acme", "assistant", "alice", "sess-1")
    }

    fn pipeline_with(
        episodes: Arc<MemoryEpisodeStore>,
        profiles: Arc<MemoryProfileStore>,
        extractor: Arc<dyn ExtractionService>,
    ) -> ExtractionPipeline {
        ExtractionPipeline::new(
            episodes,
            profiles,
            extractor,
            Arc::new(HashingEmbedder::default()),
            ExtractionConfig {
                base_backoff: std::time::Duration::from_millis(1),
                ..Default::default()
            },
            MergePolicy::default(),
        )
    }

    fn preference_rules() -> ScriptedExtractor {
        ScriptedExtractor::default()
            .with_rule(ExtractionRule::new(
                "prefer email",
                "preference",
                "contact_channel",
                serde_json::json!("email"),
                0.9,
            ))
            .with_rule(ExtractionRule::new(
                "work in sales",
                "role",
                "department",
                serde_json::json!("sales"),
                0.9,
            ))
    }

    #[tokio::test]
    async fn test_run_extracts_and_advances_watermark() {
        let episodes = Arc::new(MemoryEpisodeStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        episodes
            .append(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();
        episodes
            .append(&scope(), EpisodeDraft::message("alice", "I work in sales"))
            .await
            .unwrap();

        let pipeline = pipeline_with(episodes, profiles.clone(), Arc::new(preference_rules()));
        let outcome = pipeline.run(&scope(), 0).await.unwrap();

        assert_eq!(outcome.new_watermark, 2);
        assert_eq!(outcome.facts_written, 2);

        let facts = profiles.query("acme", "alice", None).await.unwrap();
        assert_eq!(facts.len(), 2);
    }

    #[tokio::test]
    async fn test_rerun_over_same_batch_is_idempotent() {
        let episodes = Arc::new(MemoryEpisodeStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        episodes
            .append(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();

        let pipeline = pipeline_with(episodes, profiles.clone(), Arc::new(preference_rules()));
        pipeline.run(&scope(), 0).await.unwrap();
        pipeline.run(&scope(), 0).await.unwrap();

        let facts = profiles.query("acme", "alice", None).await.unwrap();
        assert_eq!(facts.len(), 1, "replayed batch must not duplicate facts");
    }

    #[tokio::test]
    async fn test_userless_scope_is_rejected() {
        let episodes = Arc::new(MemoryEpisodeStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        let pipeline = pipeline_with(episodes, profiles.clone(), Arc::new(preference_rules()));

        let mut anonymous = scope();
        anonymous.user_ids.clear();

        let err = pipeline.run(&anonymous, 0).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Store(StoreError::InvalidScope(_))
        ));
        assert!(profiles.query("acme", "alice", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let episodes = Arc::new(MemoryEpisodeStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        let pipeline = pipeline_with(episodes, profiles, Arc::new(preference_rules()));

        let outcome = pipeline.run(&scope(), 0).await.unwrap();
        assert_eq!(outcome.new_watermark, 0);
        assert_eq!(outcome.facts_written, 0);
    }

    /// Extractor that fails a fixed number of times before succeeding.
    struct FlakyExtractor {
        failures: AtomicU32,
        inner: ScriptedExtractor,
    }

    #[async_trait]
    impl ExtractionService for FlakyExtractor {
        async fn extract(&self, episodes: &[Episode]) -> Result<Vec<FactCandidate>> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return Err(MemoryError::Capability("model unreachable".to_string()));
            }
            self.inner.extract(episodes).await
        }
    }

    #[tokio::test]
    async fn test_transient_capability_failure_is_retried() {
        let episodes = Arc::new(MemoryEpisodeStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        episodes
            .append(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();

        let extractor = Arc::new(FlakyExtractor {
            failures: AtomicU32::new(2),
            inner: preference_rules(),
        });
        let pipeline = pipeline_with(episodes, profiles, extractor);

        let outcome = pipeline.run(&scope(), 0).await.unwrap();
        assert_eq!(outcome.facts_written, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_parks_batch() {
        let episodes = Arc::new(MemoryEpisodeStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        episodes
            .append(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();

        let extractor = Arc::new(FlakyExtractor {
            failures: AtomicU32::new(u32::MAX),
            inner: preference_rules(),
        });
        let pipeline = pipeline_with(episodes, profiles.clone(), extractor);

        let err = pipeline.run(&scope(), 0).await.unwrap_err();
        assert!(matches!(err, MemoryError::ExtractionFailed { .. }));
        assert!(profiles.query("acme", "alice", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_conflicts_are_collected_not_fatal() {
        let episodes = Arc::new(MemoryEpisodeStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        episodes
            .append(&scope(), EpisodeDraft::message("alice", "I prefer email"))
            .await
            .unwrap();
        episodes
            .append(&scope(), EpisodeDraft::message("alice", "I prefer phone"))
            .await
            .unwrap();

        let extractor = ScriptedExtractor::default()
            .with_rule(ExtractionRule::new(
                "prefer email",
                "preference",
                "contact_channel",
                serde_json::json!("email"),
                0.7,
            ))
            .with_rule(ExtractionRule::new(
                "prefer phone",
                "preference",
                "contact_channel",
                serde_json::json!("phone"),
                0.7,
            ));

        let pipeline = ExtractionPipeline::new(
            episodes,
            profiles,
            Arc::new(extractor),
            Arc::new(HashingEmbedder::default()),
            ExtractionConfig::default(),
            MergePolicy::Reject,
        );

        let outcome = pipeline.run(&scope(), 0).await.unwrap();
        assert_eq!(outcome.facts_written, 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.new_watermark, 2);
    }
}
