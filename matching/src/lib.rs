//! Grant matching engine
//!
//! Two-phase matching: pgvector cosine similarity selects candidates, the
//! LLM re-ranks the best of them, and the weighted final score decides
//! what is persisted and published to `matches:computed`.

pub mod embedder;
pub mod matcher;
pub mod models;
pub mod profile_builder;

pub use embedder::{GrantEmbedder, EMBED_BATCH_SIZE};
pub use matcher::{GrantMatcher, MatchingStats};
pub use models::{
    compute_final_score, priority_level, should_publish, LlmMatchResult, FINAL_MATCH_THRESHOLD,
    LLM_BATCH_SIZE, LLM_RERANK_LIMIT, TOP_CANDIDATES, VECTOR_THRESHOLD,
};
pub use profile_builder::{needs_refresh, profile_text_hash, ProfileBuilder};
