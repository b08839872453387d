//! Curation/validation agent
//!
//! Consumes `grants:discovered`, scores quality (LLM with a rubric
//! fallback), categorizes against a fixed vocabulary, embeds, checks for
//! cross-source duplicates, persists the enriched grant, and publishes to
//! `grants:validated`. Grants below the quality threshold are sidelined to
//! the manual-review list instead of being published.

pub mod categories;
pub mod dedup;
pub mod quality;
pub mod validator;

pub use categories::{filter_categories, CATEGORY_VOCABULARY};
pub use dedup::{is_duplicate_candidate, merge_duplicate, RecentValidatedGrant};
pub use quality::{rubric_score, ValidationResult, QUALITY_THRESHOLD};
pub use validator::CurationValidator;
