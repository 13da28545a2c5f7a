//! Cadence Core Library
//!
//! Shared functionality for the Cadence recurring-obligation tracker:
//! - Database access and migrations
//! - Deterministic pattern discovery (grouping, cluster splitting, the
//!   ten-stage engine, idempotent persistence)
//! - Runtime matching of new transactions against expected obligations,
//!   with lazy miss detection and state degradation
//! - Obligation arithmetic (tolerance windows, rolls, forecast ranges)
//! - Per-user and per-key serialisation primitives
//! - Pluggable pattern summariser adapter

pub mod db;
pub mod discovery;
pub mod error;
pub mod locks;
pub mod matcher;
pub mod models;
pub mod obligation;
pub mod summarise;

pub use db::{Database, NewObligation, TransactionInsertResult};
pub use discovery::{
    DiscoveredPattern, DiscoveryConfig, DiscoveryFilters, DiscoveryOutcome, PatternCandidate,
    PatternDiscovery, SkipReason,
};
pub use error::{Error, Result};
pub use locks::{KeyedLocks, MatchKey, SingleFlight};
pub use matcher::{spawn_match, MatchConfig, MatchOutcome, TransactionMatcher};
pub use summarise::{NoopSummariser, PatternSummariser, TemplateSummariser};
