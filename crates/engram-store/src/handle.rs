//! SurrealDB Handle - Connection and Operations
//!
//! Manages connection and implements both storage traits:
//! - `EpisodeStore`: append / read_recent / read_after / search / clear
//! - `ProfileStore`: upsert (versioned compare-and-swap) / query /
//!   vector_search / purge_user
//!
//! Supports both local (in-memory) and cloud (WebSocket) connections.

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::merge::{self, MergeDecision, MergePolicy};
use crate::schema::{Episode, EpisodeDraft, FactProposal, ProfileFact};
use crate::scope::Scope;
use crate::scoring::{cosine_similarity, keyword_overlap};
use crate::storage_traits::{EpisodeStore, ProfileStore};

/// Retries for seq-assignment and compare-and-swap races.
const CAS_RETRIES: usize = 8;

/// Configuration for SurrealDB Cloud connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "engram")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new cloud configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: "engram".to_string(),
            database: "main".to_string(),
            is_root: false,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "engram")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "engram".to_string());
        let database = std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// SurrealDB connection handle for Engram
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn setup_db() -> StoreResult<Self> {
        info!("Connecting to SurrealDB (in-memory)");
        Self::connect("mem://").await
    }

    /// Connect to an arbitrary engine URL (mem://, surrealkv://, ws://, ...)
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        db.use_ns("engram")
            .use_db("main")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;

        info!("SurrealDB connected and schema initialized");
        Ok(handle)
    }

    /// Connect to SurrealDB Cloud
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace))]
    pub async fn setup_cloud(config: CloudConfig) -> StoreResult<Self> {
        info!("Connecting to SurrealDB Cloud (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to connect to {}: {}",
                    config.endpoint, e
                ))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StoreError::Unavailable(format!("root authentication failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("database authentication failed: {e}"))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("failed to select namespace/database: {e}"))
            })?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;

        info!("SurrealDB Cloud connected and schema initialized");
        Ok(handle)
    }

    /// Connect using environment variables
    ///
    /// If SURREALDB_ENDPOINT is set, connects to cloud.
    /// If SURREALDB_URL is set, connects to that URL.
    /// Otherwise, falls back to in-memory.
    #[instrument(skip_all)]
    pub async fn setup_from_env() -> StoreResult<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            info!("Cloud config found, connecting to SurrealDB Cloud");
            return Self::setup_cloud(config).await;
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            info!("SURREALDB_URL found, connecting to {}", url);
            return Self::connect(&url).await;
        }

        info!("No cloud config found, using in-memory database");
        Self::setup_db().await
    }

    /// Initialize the database schema
    async fn init_schema(&self) -> StoreResult<()> {
        debug!("Initializing Engram schema");

        // Schemaless tables; the unique indexes are what the adapters rely
        // on for seq assignment and merge-key uniqueness.
        let schema = r#"
            DEFINE TABLE IF NOT EXISTS episodes SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_episode_session_seq
                ON episodes FIELDS group_id, session_id, seq UNIQUE;

            DEFINE TABLE IF NOT EXISTS facts SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_fact_merge_key
                ON facts FIELDS group_id, user_id, tag, feature UNIQUE;
        "#;

        self.db
            .query(schema)
            .await
            .map_err(|e| StoreError::Backend(format!("schema setup failed: {e}")))?;

        Ok(())
    }

    /// Highest assigned seq for a session (0 when empty).
    async fn max_seq(&self, scope: &Scope) -> StoreResult<u64> {
        #[derive(serde::Deserialize)]
        struct MaxSeq {
            max_seq: Option<u64>,
        }

        let mut result = self
            .db
            .query(
                "SELECT math::max(seq) AS max_seq FROM episodes \
                 WHERE group_id = $group AND session_id = $sess GROUP ALL",
            )
            .bind(("group", scope.group_id.clone()))
            .bind(("sess", scope.session_id.clone()))
            .await?;

        let rows: Vec<MaxSeq> = result.take(0)?;
        Ok(rows.into_iter().next().and_then(|r| r.max_seq).unwrap_or(0))
    }

    /// Current fact for a merge key, if any.
    async fn get_fact(
        &self,
        group_id: &str,
        user_id: &str,
        tag: &str,
        feature: &str,
    ) -> StoreResult<Option<ProfileFact>> {
        let mut result = self
            .db
            .query(
                "SELECT * FROM facts WHERE group_id = $group AND user_id = $user \
                 AND tag = $tag AND feature = $feature",
            )
            .bind(("group", group_id.to_string()))
            .bind(("user", user_id.to_string()))
            .bind(("tag", tag.to_string()))
            .bind(("feature", feature.to_string()))
            .await?;

        let facts: Vec<ProfileFact> = result.take(0)?;
        Ok(facts.into_iter().next())
    }

    /// All non-tombstoned episodes for a scope (search input).
    async fn session_episodes(&self, scope: &Scope) -> StoreResult<Vec<Episode>> {
        let mut result = self
            .db
            .query(
                "SELECT * FROM episodes WHERE group_id = $group AND session_id = $sess \
                 AND deleted = false",
            )
            .bind(("group", scope.group_id.clone()))
            .bind(("sess", scope.session_id.clone()))
            .await?;

        let episodes: Vec<Episode> = result.take(0)?;
        Ok(episodes)
    }
}

#[async_trait]
impl EpisodeStore for SurrealHandle {
    #[instrument(skip(self, draft), fields(session = %scope.session_id))]
    async fn append(&self, scope: &Scope, draft: EpisodeDraft) -> StoreResult<Episode> {
        scope.validate()?;

        // seq assignment races are caught by the unique session/seq index;
        // losers re-read the max and retry.
        let mut last_err = None;
        for attempt in 0..CAS_RETRIES {
            let seq = self.max_seq(scope).await? + 1;
            let episode = Episode {
                episode_id: Uuid::new_v4(),
                seq,
                group_id: scope.group_id.clone(),
                session_id: scope.session_id.clone(),
                producer_id: draft.producer_id.clone(),
                produced_for_id: draft.produced_for_id.clone(),
                episode_type: draft.episode_type,
                content: draft.content.clone(),
                embedding: draft.embedding.clone(),
                metadata: draft.metadata.clone(),
                created_at: Utc::now(),
                deleted: false,
            };

            let created: Result<Option<Episode>, surrealdb::Error> = self
                .db
                .create("episodes")
                .content(episode.clone())
                .await;

            match created {
                Ok(_) => {
                    debug!(seq, "episode appended");
                    return Ok(episode);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "seq assignment race, retrying");
                    last_err = Some(e);
                }
            }
        }

        Err(StoreError::Unavailable(format!(
            "seq assignment exhausted retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    #[instrument(skip(self), fields(session = %scope.session_id))]
    async fn read_recent(
        &self,
        scope: &Scope,
        limit: usize,
        before_seq: Option<u64>,
    ) -> StoreResult<Vec<Episode>> {
        scope.validate()?;

        let cursor_clause = match before_seq {
            Some(_) => "AND seq < $cursor ",
            None => "",
        };
        let query = format!(
            "SELECT * FROM episodes WHERE group_id = $group AND session_id = $sess \
             AND deleted = false {cursor_clause}ORDER BY seq DESC LIMIT {limit}"
        );

        let mut result = self
            .db
            .query(query)
            .bind(("group", scope.group_id.clone()))
            .bind(("sess", scope.session_id.clone()))
            .bind(("cursor", before_seq.unwrap_or(0)))
            .await?;

        let episodes: Vec<Episode> = result.take(0)?;
        Ok(episodes)
    }

    #[instrument(skip(self), fields(session = %scope.session_id))]
    async fn read_after(
        &self,
        scope: &Scope,
        after_seq: u64,
        limit: usize,
    ) -> StoreResult<Vec<Episode>> {
        scope.validate()?;

        let query = format!(
            "SELECT * FROM episodes WHERE group_id = $group AND session_id = $sess \
             AND deleted = false AND seq > $after ORDER BY seq ASC LIMIT {limit}"
        );

        let mut result = self
            .db
            .query(query)
            .bind(("group", scope.group_id.clone()))
            .bind(("sess", scope.session_id.clone()))
            .bind(("after", after_seq))
            .await?;

        let episodes: Vec<Episode> = result.take(0)?;
        Ok(episodes)
    }

    #[instrument(skip(self, query_embedding), fields(session = %scope.session_id))]
    async fn search(
        &self,
        scope: &Scope,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        k: usize,
    ) -> StoreResult<Vec<(Episode, f64)>> {
        scope.validate()?;

        // Similarity is computed in-process over the session's episodes.
        // Sessions are bounded conversations, so the scan stays small.
        let episodes = self.session_episodes(scope).await?;
        let mut scored: Vec<(Episode, f64)> = episodes
            .into_iter()
            .filter_map(|e| {
                let score = match (query_embedding, &e.embedding) {
                    (Some(q), Some(emb)) => cosine_similarity(q, emb),
                    _ => keyword_overlap(query_text, &e.content),
                };
                (score > 0.0).then_some((e, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.seq.cmp(&a.0.seq))
        });
        scored.truncate(k);
        Ok(scored)
    }

    #[instrument(skip(self), fields(session = %scope.session_id))]
    async fn clear(&self, scope: &Scope) -> StoreResult<()> {
        scope.validate()?;

        self.db
            .query(
                "UPDATE episodes SET deleted = true \
                 WHERE group_id = $group AND session_id = $sess",
            )
            .bind(("group", scope.group_id.clone()))
            .bind(("sess", scope.session_id.clone()))
            .await?;

        info!("session cleared");
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for SurrealHandle {
    #[instrument(skip(self, proposal, policy), fields(tag = %proposal.tag, feature = %proposal.feature))]
    async fn upsert(
        &self,
        proposal: FactProposal,
        policy: MergePolicy,
    ) -> StoreResult<ProfileFact> {
        // Compare-and-swap: read the current fact, resolve the policy, then
        // write conditionally on the version counter. Losers retry.
        for attempt in 0..CAS_RETRIES {
            let existing = self
                .get_fact(
                    &proposal.group_id,
                    &proposal.user_id,
                    &proposal.tag,
                    &proposal.feature,
                )
                .await?;

            match merge::resolve(existing.as_ref(), &proposal, policy, Utc::now()) {
                MergeDecision::Create(fact) => {
                    let created: Result<Option<ProfileFact>, surrealdb::Error> =
                        self.db.create("facts").content(fact.clone()).await;
                    match created {
                        Ok(_) => return Ok(fact),
                        Err(e) => {
                            // Unique merge-key index tripped: someone else
                            // created the fact first. Re-read and re-resolve.
                            debug!(attempt, error = %e, "create race, retrying");
                            continue;
                        }
                    }
                }
                MergeDecision::Replace(fact) => {
                    let expected = existing.as_ref().map(|f| f.version).ok_or_else(|| {
                        StoreError::Backend("replace without existing fact".to_string())
                    })?;
                    let mut fact = fact;
                    fact.version = expected + 1;

                    let mut result = self
                        .db
                        .query(
                            "UPDATE facts CONTENT $fact \
                             WHERE group_id = $group AND user_id = $user \
                             AND tag = $tag AND feature = $feature \
                             AND version = $expected RETURN AFTER",
                        )
                        .bind(("fact", fact.clone()))
                        .bind(("group", proposal.group_id.clone()))
                        .bind(("user", proposal.user_id.clone()))
                        .bind(("tag", proposal.tag.clone()))
                        .bind(("feature", proposal.feature.clone()))
                        .bind(("expected", expected))
                        .await?;

                    let updated: Vec<ProfileFact> = result.take(0)?;
                    if updated.is_empty() {
                        debug!(attempt, "version race, retrying");
                        continue;
                    }
                    return Ok(fact);
                }
                MergeDecision::DropMinority => {
                    debug!("minority opinion dropped");
                    return existing.ok_or_else(|| {
                        StoreError::Backend("minority drop without existing fact".to_string())
                    });
                }
                MergeDecision::Unchanged => {
                    return existing.ok_or_else(|| {
                        StoreError::Backend("unchanged without existing fact".to_string())
                    });
                }
                MergeDecision::Ambiguous => {
                    return Err(StoreError::ConflictUnresolved {
                        tag: proposal.tag,
                        feature: proposal.feature,
                    });
                }
            }
        }

        warn!("upsert exhausted compare-and-swap retries");
        Err(StoreError::Unavailable(
            "upsert exhausted compare-and-swap retries".to_string(),
        ))
    }

    #[instrument(skip(self))]
    async fn query(
        &self,
        group_id: &str,
        user_id: &str,
        tags: Option<&[String]>,
    ) -> StoreResult<Vec<ProfileFact>> {
        let mut result = match tags {
            Some(tags) => {
                self.db
                    .query(
                        "SELECT * FROM facts WHERE group_id = $group AND user_id = $user \
                         AND tag IN $tags",
                    )
                    .bind(("group", group_id.to_string()))
                    .bind(("user", user_id.to_string()))
                    .bind(("tags", tags.to_vec()))
                    .await?
            }
            None => {
                self.db
                    .query("SELECT * FROM facts WHERE group_id = $group AND user_id = $user")
                    .bind(("group", group_id.to_string()))
                    .bind(("user", user_id.to_string()))
                    .await?
            }
        };

        let mut facts: Vec<ProfileFact> = result.take(0)?;
        facts.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.fact_id.cmp(&b.fact_id))
        });
        Ok(facts)
    }

    #[instrument(skip(self, query_embedding))]
    async fn vector_search(
        &self,
        group_id: &str,
        user_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> StoreResult<Vec<(ProfileFact, f64)>> {
        let facts = self.query(group_id, user_id, None).await?;
        let mut scored: Vec<(ProfileFact, f64)> = facts
            .into_iter()
            .filter_map(|f| {
                let score = f
                    .embedding
                    .as_ref()
                    .map(|emb| cosine_similarity(query_embedding, emb))?;
                (score > 0.0).then_some((f, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.fact_id.cmp(&b.0.fact_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    #[instrument(skip(self))]
    async fn purge_user(&self, group_id: &str, user_id: &str) -> StoreResult<u64> {
        let mut result = self
            .db
            .query(
                "DELETE FROM facts WHERE group_id = $group AND user_id = $user \
                 RETURN BEFORE",
            )
            .bind(("group", group_id.to_string()))
            .bind(("user", user_id.to_string()))
            .await?;

        let deleted: Vec<ProfileFact> = result.take(0)?;
        info!(count = deleted.len(), "user profile purged");
        Ok(deleted.len() as u64)
    }
}
