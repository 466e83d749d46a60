//! Engram Store - Scope model, records, and storage backends
//!
//! Layer 0 of the Engram memory system. Defines the scope/partition model,
//! the episode and profile fact records, the storage traits the Memory Core
//! runs on, the pure merge-policy engine, a SurrealDB backend, and in-memory
//! fakes for testing.

pub mod error;
pub mod fakes;
pub mod handle;
pub mod merge;
pub mod schema;
pub mod scope;
pub mod scoring;
pub mod storage_traits;

pub use error::{StoreError, StoreResult};
pub use handle::{CloudConfig, SurrealHandle};
pub use merge::{MergeDecision, MergePolicy};
pub use schema::{
    fact_merge_key, hash_value, value_text, Episode, EpisodeDraft, EpisodeType, FactProposal,
    FactVersion, ProfileFact,
};
pub use scope::Scope;
pub use scoring::{cosine_similarity, keyword_overlap};
pub use storage_traits::{EpisodeStore, ProfileStore};
