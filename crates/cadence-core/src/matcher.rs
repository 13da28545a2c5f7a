//! Runtime matcher / obligation manager
//!
//! Invoked once per newly persisted transaction. Finds the matchable
//! patterns on the transaction's key, lazily sweeps overdue obligations
//! into misses, fulfils the tightest-scoring match, and rolls the next
//! expected obligation. Never creates patterns - that is the discovery
//! path's job alone.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::db::{Database, NewObligation};
use crate::error::{Error, Result};
use crate::locks::{KeyedLocks, MatchKey};
use crate::models::{Obligation, Pattern, PatternStatus, Transaction};
use crate::obligation;

/// Runtime matcher configuration
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Stop at the first (tightest) fulfilled pattern; multi-pattern
    /// fulfilment is opt-in
    pub first_match_wins: bool,
    /// Upper bound on roll-forward cycles when collapsing a long gap
    pub max_catchup_cycles: usize,
    /// Retry budget for asynchronous matcher work
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    /// Hard wall-clock ceiling for one matcher invocation
    pub match_timeout: Duration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            first_match_wins: true,
            max_catchup_cycles: 6,
            retry_attempts: 5,
            retry_base_delay: Duration::from_secs(1),
            match_timeout: Duration::from_secs(30),
        }
    }
}

/// What one matcher invocation did
#[derive(Debug, Default, Clone)]
pub struct MatchOutcome {
    pub matched_pattern_ids: Vec<i64>,
    pub misses_recorded: usize,
    pub repairs: usize,
}

/// Processes new transactions against existing patterns
pub struct TransactionMatcher {
    db: Database,
    config: MatchConfig,
    locks: Arc<KeyedLocks>,
}

impl TransactionMatcher {
    pub fn new(db: Database, locks: Arc<KeyedLocks>) -> Self {
        Self {
            db,
            config: MatchConfig::default(),
            locks,
        }
    }

    pub fn with_config(db: Database, locks: Arc<KeyedLocks>, config: MatchConfig) -> Self {
        Self { db, config, locks }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Process one newly persisted transaction
    ///
    /// All work on the transaction's (user, payee, direction, currency)
    /// key is serialised behind a keyed lock, which keeps obligation
    /// transitions linearly ordered and streak updates lossless.
    pub async fn process_transaction(&self, transaction_id: i64) -> Result<MatchOutcome> {
        let transaction = self
            .db
            .get_transaction(transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("Transaction {} not found", transaction_id)))?;

        let key = MatchKey {
            user_id: transaction.user_id,
            payee_id: transaction.payee_id,
            direction: transaction.direction,
            currency_id: transaction.currency_id,
        };
        let _guard = self.locks.acquire(key).await;

        let patterns = self.db.matchable_patterns(
            transaction.user_id,
            transaction.payee_id,
            transaction.direction,
            transaction.currency_id,
        )?;

        debug!(
            transaction_id,
            date = %transaction.date(),
            patterns = patterns.len(),
            "Matching transaction against patterns"
        );

        let mut outcome = MatchOutcome::default();
        let mut candidates: Vec<(f64, Pattern, Obligation)> = Vec::new();

        for pattern in patterns {
            let obligation = match self.resolve_pending(&pattern, &mut outcome)? {
                Some(obligation) => obligation,
                None => continue,
            };

            let obligation = self.sweep_overdue(&pattern, obligation, &transaction, &mut outcome)?;

            if obligation.window_contains(transaction.date()) {
                let score =
                    obligation::ambiguity_score(transaction.date(), transaction.amount, &obligation);
                candidates.push((score, pattern, obligation));
            }
        }

        // Tightest (date window, amount band) fit wins; ties break on the
        // lowest pattern id.
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.id.cmp(&b.1.id))
        });

        for (score, pattern, obligation) in candidates {
            let next = self.roll_after(&pattern, &obligation, Some(transaction.amount))?;
            self.db
                .apply_fulfilment(&pattern, &obligation, &transaction, &next)?;

            info!(
                transaction_id,
                pattern_id = pattern.id,
                score = format!("{:.3}", score).as_str(),
                expected = %obligation.expected_date,
                next_expected = %next.expected_date,
                "Obligation fulfilled"
            );

            outcome.matched_pattern_ids.push(pattern.id);
            if self.config.first_match_wins {
                break;
            }
        }

        Ok(outcome)
    }

    /// Find the pending obligation, repairing malformed patterns
    ///
    /// An unarchived pattern without an expected obligation is recoverable:
    /// a replacement is rolled from the last actual date. Without one the
    /// pattern is paused and left for re-discovery.
    fn resolve_pending(
        &self,
        pattern: &Pattern,
        outcome: &mut MatchOutcome,
    ) -> Result<Option<Obligation>> {
        if let Some(obligation) = self.db.pending_obligation(pattern.id)? {
            return Ok(Some(obligation));
        }

        let streak = self.db.get_streak(pattern.id)?;
        let last_actual = streak.and_then(|s| s.last_actual_date);

        match last_actual {
            Some(last_actual) => {
                let next = NewObligation {
                    expected_date: obligation::next_expected_date(
                        last_actual,
                        pattern.interval_days,
                    ),
                    tolerance_days: obligation::tolerance_days(
                        pattern.pattern_case,
                        pattern.interval_days,
                    ),
                    expected_min_amount: None,
                    expected_max_amount: None,
                };
                let repaired = self.db.create_repair_obligation(pattern.id, &next)?;
                outcome.repairs += 1;
                Ok(Some(repaired))
            }
            None => {
                warn!(
                    pattern_id = pattern.id,
                    "Pattern has no pending obligation and no history; pausing for re-discovery"
                );
                self.db.set_pattern_status(pattern.id, PatternStatus::Paused)?;
                Ok(None)
            }
        }
    }

    /// Lazy miss sweep: resolve every obligation the transaction has
    /// already sailed past, rolling forward up to the catch-up bound
    fn sweep_overdue(
        &self,
        pattern: &Pattern,
        mut obligation: Obligation,
        transaction: &Transaction,
        outcome: &mut MatchOutcome,
    ) -> Result<Obligation> {
        let mut cycles = 0;

        while obligation.is_overdue_at(transaction.date()) && cycles < self.config.max_catchup_cycles
        {
            let missed_count = self
                .db
                .get_streak(pattern.id)?
                .map(|s| s.missed_count)
                .unwrap_or(0)
                + 1;
            let new_status = degraded_status(missed_count);

            let next = self.roll_after(pattern, &obligation, None)?;
            debug!(
                pattern_id = pattern.id,
                missed = %obligation.expected_date,
                next = %next.expected_date,
                missed_count,
                status = new_status.as_str(),
                "Lazily marking obligation missed"
            );

            obligation = self
                .db
                .apply_miss(pattern.id, obligation.id, new_status, &next)?;
            outcome.misses_recorded += 1;
            cycles += 1;
        }

        Ok(obligation)
    }

    /// Build the next obligation, anchored on the prior expected date
    fn roll_after(
        &self,
        pattern: &Pattern,
        prior: &Obligation,
        incoming_amount: Option<Decimal>,
    ) -> Result<NewObligation> {
        let window = self.forecast_window(pattern, incoming_amount)?;
        let (min_amount, max_amount) = obligation::estimate_amount_range(
            &window,
            pattern.amount_behaviour,
            pattern.representative_amount,
        );

        Ok(NewObligation {
            expected_date: obligation::next_expected_date(
                prior.expected_date,
                pattern.interval_days,
            ),
            tolerance_days: obligation::tolerance_days(pattern.pattern_case, pattern.interval_days),
            expected_min_amount: Some(min_amount),
            expected_max_amount: Some(max_amount),
        })
    }

    /// Amounts of the last three inlier transactions, counting the one
    /// being matched right now
    fn forecast_window(
        &self,
        pattern: &Pattern,
        incoming_amount: Option<Decimal>,
    ) -> Result<Vec<Decimal>> {
        let take = if incoming_amount.is_some() { 2 } else { 3 };
        let recent = self.db.recent_linked_amounts(pattern.id, take)?;

        let mut window: Vec<Decimal> = incoming_amount.into_iter().chain(recent).collect();

        // Outlier amounts stay linked but don't steer the forecast
        let tolerance = (pattern.representative_amount.abs() * Decimal::new(25, 2))
            .max(Decimal::new(50, 0));
        let inliers: Vec<Decimal> = window
            .iter()
            .copied()
            .filter(|a| (*a - pattern.representative_amount).abs() <= tolerance)
            .collect();
        if !inliers.is_empty() {
            window = inliers;
        }

        Ok(window)
    }
}

/// State degradation thresholds: one grace miss, three before breaking
fn degraded_status(missed_count: i64) -> PatternStatus {
    if missed_count <= 1 {
        PatternStatus::Active
    } else if missed_count <= 3 {
        PatternStatus::Paused
    } else {
        PatternStatus::Broken
    }
}

/// Dispatch one matcher invocation in the background with bounded retries
///
/// Transient failures back off exponentially; exhausting the budget (or an
/// unretryable error) lands the transaction id in the dead-letter store so
/// no work is silently lost.
pub fn spawn_match(matcher: Arc<TransactionMatcher>, transaction_id: i64) {
    tokio::spawn(async move {
        let mut last_error = String::new();
        let attempts = matcher.config.retry_attempts.max(1);

        for attempt in 1..=attempts {
            let run = tokio::time::timeout(
                matcher.config.match_timeout,
                matcher.process_transaction(transaction_id),
            )
            .await
            .unwrap_or_else(|_| {
                Err(Error::Retryable(format!(
                    "Matcher timed out after {:?}",
                    matcher.config.match_timeout
                )))
            });

            match run {
                Ok(outcome) => {
                    info!(
                        transaction_id,
                        matched = outcome.matched_pattern_ids.len(),
                        misses = outcome.misses_recorded,
                        repairs = outcome.repairs,
                        "Matcher run complete"
                    );
                    return;
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    last_error = e.to_string();
                    let delay = matcher.config.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        transaction_id,
                        attempt,
                        error = %last_error,
                        ?delay,
                        "Matcher attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    last_error = e.to_string();
                    let spent = attempt as i64;
                    error!(
                        transaction_id,
                        attempts = spent,
                        error = %last_error,
                        "Matcher gave up; dead-lettering"
                    );
                    if let Err(dl) =
                        matcher
                            .db
                            .record_dead_letter(transaction_id, spent, &last_error)
                    {
                        error!(transaction_id, error = %dl, "Failed to record dead letter");
                    }
                    return;
                }
            }
        }

        let spent = attempts as i64;
        error!(
            transaction_id,
            attempts = spent,
            error = %last_error,
            "Matcher retry budget exhausted; dead-lettering"
        );
        if let Err(dl) = matcher.db.record_dead_letter(transaction_id, spent, &last_error) {
            error!(transaction_id, error = %dl, "Failed to record dead letter");
        }
    });
}
