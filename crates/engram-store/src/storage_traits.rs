//! Storage trait definitions for Engram
//!
//! These traits define the two storage abstractions the Memory Core runs on:
//! - `EpisodeStore`: append-ordered episodic events, scoped per session
//! - `ProfileStore`: merge-keyed profile facts with compare-and-swap upserts
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::merge::MergePolicy;
use crate::schema::{Episode, EpisodeDraft, FactProposal, ProfileFact};
use crate::scope::Scope;

/// Episodic event store.
///
/// Guarantees:
/// - `append` assigns a strictly increasing `seq` within a session and is
///   visible to `read_recent`/`read_after` calls issued after it returns.
/// - Reads never observe a partially written episode.
/// - `clear` tombstones rather than deletes; it is idempotent.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    /// Append an episode to the scope's session.
    async fn append(&self, scope: &Scope, draft: EpisodeDraft) -> StoreResult<Episode>;

    /// Read episodes newest-first, optionally strictly below a seq cursor.
    /// Tombstoned episodes are excluded.
    async fn read_recent(
        &self,
        scope: &Scope,
        limit: usize,
        before_seq: Option<u64>,
    ) -> StoreResult<Vec<Episode>>;

    /// Read episodes oldest-first with seq strictly greater than `after_seq`.
    /// Extraction input above the watermark.
    async fn read_after(
        &self,
        scope: &Scope,
        after_seq: u64,
        limit: usize,
    ) -> StoreResult<Vec<Episode>>;

    /// Scored relevance search over the scope's episodes. Uses embedding
    /// similarity when both sides carry embeddings, keyword overlap otherwise.
    /// Zero-scored episodes are omitted.
    async fn search(
        &self,
        scope: &Scope,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        k: usize,
    ) -> StoreResult<Vec<(Episode, f64)>>;

    /// Tombstone every episode in the scope's session.
    async fn clear(&self, scope: &Scope) -> StoreResult<()>;
}

/// Profile fact store.
///
/// Guarantees:
/// - At most one current fact per (group_id, user_id, tag, feature).
/// - `upsert` is compare-and-swap: concurrent writers on the same merge key
///   never lose updates; losers re-read and re-resolve.
/// - Duplicate values are idempotent no-ops under every merge policy.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Merge a proposal into the store under the given policy. Returns the
    /// current fact for the key after the merge (unchanged on duplicates and
    /// dropped minority opinions).
    async fn upsert(&self, proposal: FactProposal, policy: MergePolicy)
        -> StoreResult<ProfileFact>;

    /// Current facts for a user, optionally filtered by tag.
    async fn query(
        &self,
        group_id: &str,
        user_id: &str,
        tags: Option<&[String]>,
    ) -> StoreResult<Vec<ProfileFact>>;

    /// Embedding-similarity search over a user's facts, best-first.
    async fn vector_search(
        &self,
        group_id: &str,
        user_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> StoreResult<Vec<(ProfileFact, f64)>>;

    /// Delete every fact for a user. Returns the number removed.
    async fn purge_user(&self, group_id: &str, user_id: &str) -> StoreResult<u64>;
}
