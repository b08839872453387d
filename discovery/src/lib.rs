//! Grant discovery agents
//!
//! Each source fetches candidate grants, normalizes them into
//! `DiscoveredGrant` records, and the shared agent dedups against the
//! source's seen set before publishing to `grants:discovered`. Polling
//! cadence is driven by an external scheduler; agents only expose `run()`.

pub mod agent;
pub mod grants_gov;
pub mod nih_page;
pub mod nih_reporter;
pub mod nsf;
pub mod rate_limit;

pub use agent::{DiscoveryAgent, GrantSource, SourceError};
pub use grants_gov::GrantsGovSource;
pub use nih_page::NihPageSource;
pub use nih_reporter::NihReporterSource;
pub use nsf::NsfSource;
pub use rate_limit::RateLimiter;
