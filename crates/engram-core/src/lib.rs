//! Memory Core for conversational agents.
//!
//! Layers an extraction pipeline (episodes -> profile facts), a hybrid
//! retrieval engine and a per-session coordinator over the `engram-store`
//! adapters. `MemoryCore` is the surface agents integrate against; the
//! capability traits in `capability` are the seam for the embedding and
//! extraction providers (`openai` ships HTTP-backed implementations).

pub mod capability;
pub mod config;
pub mod error;
pub mod extraction;
pub mod memory;
pub mod openai;
pub mod retrieval;
pub mod retry;
pub mod session;
pub mod telemetry;

pub use capability::{
    EmbeddingService, ExtractionRule, ExtractionService, FactCandidate, HashingEmbedder,
    ScriptedExtractor,
};
pub use config::{ExtractionConfig, MemoryConfig, RetrievalConfig, SessionIdleTimeout};
pub use error::{MemoryError, Result};
pub use extraction::{ExtractionOutcome, ExtractionPipeline};
pub use memory::MemoryCore;
pub use openai::{OpenAiConfig, OpenAiEmbedding, OpenAiExtraction};
pub use retrieval::{Candidate, CandidateSource, Retrieval, RetrievalEngine};
pub use session::{SessionCoordinator, SessionHealth, SessionState};
pub use telemetry::init_tracing;
