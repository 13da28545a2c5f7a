//! Pattern discovery path
//!
//! Bulk, per-user, batch-oriented: group the user's unassigned transactions
//! (C1), split each group into candidate series (C2), run the deterministic
//! engine over each cluster (C3), and persist accepted candidates (C4).
//! The runtime matcher never creates patterns; this path is the only one
//! that does.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

pub mod cluster;
pub mod engine;
pub mod grouping;

pub use cluster::Cluster;
pub use engine::PatternCandidate;
pub use grouping::{CandidateGroup, GroupKey, SkippedGroup};

use crate::db::Database;
use crate::error::Result;
use crate::models::{Direction, Pattern};
use crate::summarise::PatternSummariser;

/// Tunable thresholds for grouping, splitting, and the discovery engine
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Minimum transactions for a group or cluster to be considered
    pub min_transactions: usize,
    /// Intervals shorter than this are not recurring obligations
    pub min_interval_days: i64,
    /// Longest interval a custom pattern may carry
    pub max_interval_days: i64,
    /// More transactions than this inside the rolling window marks a
    /// frequent-purchase relationship
    pub max_per_rolling_window: usize,
    pub rolling_window_days: i64,
    /// Relative amount tolerance (symmetric)
    pub amount_tolerance_percent: Decimal,
    /// Absolute amount tolerance; the larger of the two applies
    pub amount_tolerance_absolute: Decimal,
    /// Widest wrap-aware day-of-month spread a single series may have
    pub day_window_span: u32,
    /// Minimum share of transactions inside a single amount band
    pub inlier_share_floor: f64,
    pub cv_fixed_threshold: f64,
    pub cv_variable_threshold: f64,
    /// Candidates scoring below this are rejected
    pub min_confidence: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_transactions: 3,
            min_interval_days: 10,
            max_interval_days: 400,
            max_per_rolling_window: 3,
            rolling_window_days: 30,
            amount_tolerance_percent: Decimal::new(25, 2), // 25%
            amount_tolerance_absolute: Decimal::new(50, 0),
            day_window_span: 10,
            inlier_share_floor: 0.80,
            cv_fixed_threshold: 0.05,
            cv_variable_threshold: 0.30,
            min_confidence: 0.40,
        }
    }
}

/// Why a group or cluster produced no pattern; reported, not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TooFewTransactions,
    AllTransactionsLinked,
    ClusterTooSmall,
    TooFrequent,
    UnstableInterval,
    IntervalOutOfRange,
    NoDominantAmountBand,
    UnstableWithoutOutliers,
    LowConfidence,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooFewTransactions => "too_few_transactions",
            Self::AllTransactionsLinked => "all_transactions_linked",
            Self::ClusterTooSmall => "cluster_too_small",
            Self::TooFrequent => "too_frequent",
            Self::UnstableInterval => "unstable_interval",
            Self::IntervalOutOfRange => "interval_out_of_range",
            Self::NoDominantAmountBand => "no_dominant_amount_band",
            Self::UnstableWithoutOutliers => "unstable_without_outliers",
            Self::LowConfidence => "low_confidence",
        }
    }
}

/// Optional filters for a discovery run
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryFilters {
    pub payee_id: Option<i64>,
    pub direction: Option<Direction>,
}

/// One pattern produced or refreshed by a discovery run
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPattern {
    pub pattern: Pattern,
    pub created: bool,
    pub linked_transactions: usize,
}

/// Everything a discovery run decided
#[derive(Debug, Clone, Serialize, Default)]
pub struct DiscoveryOutcome {
    pub patterns: Vec<DiscoveredPattern>,
    pub skipped: Vec<SkippedGroup>,
}

/// The discovery path runner
pub struct PatternDiscovery<'a> {
    db: &'a Database,
    config: DiscoveryConfig,
    summariser: Option<&'a dyn PatternSummariser>,
}

impl<'a> PatternDiscovery<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            config: DiscoveryConfig::default(),
            summariser: None,
        }
    }

    pub fn with_config(db: &'a Database, config: DiscoveryConfig) -> Self {
        Self {
            db,
            config,
            summariser: None,
        }
    }

    /// Attach a summariser; its annotations are advisory and never veto a
    /// pattern
    pub fn with_summariser(mut self, summariser: &'a dyn PatternSummariser) -> Self {
        self.summariser = Some(summariser);
        self
    }

    /// Run discovery for one user
    ///
    /// Idempotent: re-running without new transactions refreshes
    /// `detection_version` and `last_evaluated_at` but changes nothing
    /// else, because already-linked transactions are filtered out of the
    /// groups and the upsert resolves to the same natural key.
    pub fn discover_for_user(
        &self,
        user_id: i64,
        filters: &DiscoveryFilters,
    ) -> Result<DiscoveryOutcome> {
        info!(
            user_id,
            payee_filter = ?filters.payee_id,
            direction_filter = ?filters.direction,
            "Starting pattern discovery"
        );

        let (groups, mut skipped) =
            grouping::build_candidate_groups(self.db, user_id, filters, &self.config)?;

        info!(
            groups = groups.len(),
            skipped = skipped.len(),
            "Built candidate groups"
        );

        let mut outcome = DiscoveryOutcome::default();

        for group in groups {
            let (clusters, dropped) = cluster::split_group(&group.transactions, &self.config);
            if dropped > 0 {
                debug!(
                    payee_id = group.key.payee_id,
                    dropped, "Discarded sub-minimum cluster fragments"
                );
                skipped.push(SkippedGroup {
                    key: group.key,
                    reason: SkipReason::ClusterTooSmall,
                });
            }

            for candidate_cluster in clusters {
                match engine::evaluate_cluster(&candidate_cluster, &self.config) {
                    Ok(candidate) => {
                        let annotation = self.annotate(&group.key, &candidate)?;
                        let (pattern, created) = self.db.persist_candidate(
                            user_id,
                            &group.key,
                            &candidate,
                            annotation.as_deref(),
                        )?;

                        info!(
                            pattern_id = pattern.id,
                            created,
                            case = %pattern.pattern_case,
                            interval = pattern.interval_days,
                            confidence = format!("{:.3}", pattern.confidence).as_str(),
                            "Persisted discovered pattern"
                        );

                        outcome.patterns.push(DiscoveredPattern {
                            pattern,
                            created,
                            linked_transactions: candidate.transactions.len(),
                        });
                    }
                    Err(reason) => {
                        debug!(
                            payee_id = group.key.payee_id,
                            reason = reason.as_str(),
                            "Cluster produced no pattern"
                        );
                        skipped.push(SkippedGroup {
                            key: group.key,
                            reason,
                        });
                    }
                }
            }
        }

        outcome.skipped = skipped;

        info!(
            user_id,
            patterns = outcome.patterns.len(),
            skipped = outcome.skipped.len(),
            "Pattern discovery complete"
        );

        Ok(outcome)
    }

    fn annotate(&self, key: &GroupKey, candidate: &PatternCandidate) -> Result<Option<String>> {
        let Some(summariser) = self.summariser else {
            return Ok(None);
        };
        let payee = self.db.get_payee(key.payee_id)?;
        let payee_name = payee.map(|p| p.name).unwrap_or_else(|| "unknown".to_string());
        Ok(summariser.summarise(&payee_name, candidate))
    }
}
