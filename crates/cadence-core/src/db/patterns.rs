//! Pattern, streak, and link operations
//!
//! `persist_candidate` is the only write path the discovery side uses. It
//! is idempotent on the natural key (user, payee, direction, currency,
//! amount band, day window) and runs the whole fill order - pattern, streak,
//! links, first obligation - inside one transaction; partial commit is
//! forbidden.

use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use tracing::debug;

use super::{format_datetime, parse_amount, parse_date, parse_datetime, Database};
use crate::discovery::{GroupKey, PatternCandidate};
use crate::error::{Error, Result};
use crate::models::{
    AmountBehaviour, Direction, Pattern, PatternCase, PatternLink, PatternStatus, PatternStreak,
};
use crate::obligation;

pub(crate) const PATTERN_COLUMNS: &str = "id, user_id, payee_id, direction, currency_id, interval_days, pattern_case, \
     amount_behaviour, representative_amount, amount_min, amount_max, day_of_month_hint, \
     status, confidence, detection_version, annotation, last_evaluated_at, created_at";

pub(crate) fn row_to_pattern(row: &Row<'_>) -> rusqlite::Result<Pattern> {
    let direction_str: String = row.get(3)?;
    let case_str: String = row.get(6)?;
    let behaviour_str: String = row.get(7)?;
    let representative_str: String = row.get(8)?;
    let min_str: String = row.get(9)?;
    let max_str: String = row.get(10)?;
    let hint: Option<i64> = row.get(11)?;
    let status_str: String = row.get(12)?;
    let last_evaluated_str: String = row.get(16)?;
    let created_str: String = row.get(17)?;

    Ok(Pattern {
        id: row.get(0)?,
        user_id: row.get(1)?,
        payee_id: row.get(2)?,
        direction: Direction::from_str(&direction_str).unwrap_or(Direction::Debit),
        currency_id: row.get(4)?,
        interval_days: row.get(5)?,
        pattern_case: PatternCase::from_str(&case_str).unwrap_or(PatternCase::CustomInterval),
        amount_behaviour: AmountBehaviour::from_str(&behaviour_str)
            .unwrap_or(AmountBehaviour::Variable),
        representative_amount: parse_amount(&representative_str),
        amount_min: parse_amount(&min_str),
        amount_max: parse_amount(&max_str),
        day_of_month_hint: hint.map(|h| h as u32),
        status: PatternStatus::from_str(&status_str).unwrap_or(PatternStatus::Active),
        confidence: row.get(13)?,
        detection_version: row.get(14)?,
        annotation: row.get(15)?,
        last_evaluated_at: parse_datetime(&last_evaluated_str),
        created_at: parse_datetime(&created_str),
    })
}

/// The natural-key amount probe tolerance; representative amounts drift a
/// little between runs
fn natural_key_tolerance(representative: Decimal) -> Decimal {
    let relative = representative.abs() * Decimal::new(25, 2);
    relative.max(Decimal::new(50, 0))
}

fn day_hints_match(existing: Option<u32>, candidate: Option<u32>) -> bool {
    match (existing, candidate) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            let a = a.min(30);
            let b = b.min(30);
            let diff = a.abs_diff(b);
            diff.min(30 - diff) <= 3
        }
        _ => false,
    }
}

impl Database {
    /// Get a pattern by id
    pub fn get_pattern(&self, id: i64) -> Result<Option<Pattern>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM patterns WHERE id = ?", PATTERN_COLUMNS),
                params![id],
                row_to_pattern,
            )
            .optional()?;
        Ok(result)
    }

    /// List a user's patterns, highest confidence first
    pub fn list_patterns(
        &self,
        user_id: i64,
        status: Option<PatternStatus>,
    ) -> Result<Vec<Pattern>> {
        let conn = self.conn()?;

        let patterns = if let Some(status) = status {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM patterns WHERE user_id = ? AND status = ? \
                 ORDER BY confidence DESC, id ASC",
                PATTERN_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![user_id, status.as_str()], row_to_pattern)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM patterns WHERE user_id = ? \
                 ORDER BY confidence DESC, id ASC",
                PATTERN_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![user_id], row_to_pattern)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        Ok(patterns)
    }

    /// Patterns the matcher should consider for one transaction key:
    /// everything except archived, lowest id first for stable tie-breaks
    pub fn matchable_patterns(
        &self,
        user_id: i64,
        payee_id: i64,
        direction: Direction,
        currency_id: i64,
    ) -> Result<Vec<Pattern>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM patterns \
             WHERE user_id = ? AND payee_id = ? AND direction = ? AND currency_id = ? \
               AND status != 'archived' \
             ORDER BY id ASC",
            PATTERN_COLUMNS
        ))?;

        let patterns = stmt
            .query_map(
                params![user_id, payee_id, direction.as_str(), currency_id],
                row_to_pattern,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(patterns)
    }

    /// Update a pattern's lifecycle status
    pub fn set_pattern_status(&self, id: i64, status: PatternStatus) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE patterns SET status = ?, last_evaluated_at = ? WHERE id = ?",
            params![status.as_str(), format_datetime(Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Pattern {} not found", id)));
        }
        Ok(())
    }

    /// Hard-delete a pattern; cascades to streak, obligations, and links
    ///
    /// The runtime never does this - only an explicit, confirmed user
    /// request reaches here.
    pub fn delete_pattern(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM patterns WHERE id = ?", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Pattern {} not found", id)));
        }
        Ok(())
    }

    /// Get the streak row for a pattern
    pub fn get_streak(&self, pattern_id: i64) -> Result<Option<PatternStreak>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT pattern_id, current_streak, longest_streak, missed_count, \
                        last_actual_date, last_expected_date, confidence_multiplier, updated_at \
                 FROM pattern_streaks WHERE pattern_id = ?",
                params![pattern_id],
                |row| {
                    let last_actual: Option<String> = row.get(4)?;
                    let last_expected: Option<String> = row.get(5)?;
                    let updated_str: String = row.get(7)?;
                    Ok(PatternStreak {
                        pattern_id: row.get(0)?,
                        current_streak: row.get(1)?,
                        longest_streak: row.get(2)?,
                        missed_count: row.get(3)?,
                        last_actual_date: last_actual.as_deref().and_then(parse_date),
                        last_expected_date: last_expected.as_deref().and_then(parse_date),
                        confidence_multiplier: row.get(6)?,
                        updated_at: parse_datetime(&updated_str),
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Links for a pattern, oldest first
    pub fn list_links(&self, pattern_id: i64) -> Result<Vec<PatternLink>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT pattern_id, transaction_id, linked_at FROM pattern_links \
             WHERE pattern_id = ? ORDER BY linked_at ASC, transaction_id ASC",
        )?;
        let links = stmt
            .query_map(params![pattern_id], |row| {
                let linked_str: String = row.get(2)?;
                Ok(PatternLink {
                    pattern_id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    linked_at: parse_datetime(&linked_str),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Idempotent upsert of a discovered candidate
    ///
    /// Fill order inside one transaction: pattern, streak, links, first
    /// obligation. Existing patterns keep their id and streak; links are
    /// append-only; the streak and first obligation are seeded for new
    /// patterns only.
    pub fn persist_candidate(
        &self,
        user_id: i64,
        key: &GroupKey,
        candidate: &PatternCandidate,
        annotation: Option<&str>,
    ) -> Result<(Pattern, bool)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = format_datetime(Utc::now());

        // Natural-key probe: same key, representative amount within the
        // band tolerance, compatible day window.
        let existing_id: Option<i64> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM patterns \
                 WHERE user_id = ? AND payee_id = ? AND direction = ? AND currency_id = ? \
                   AND status != 'archived' \
                 ORDER BY id ASC",
                PATTERN_COLUMNS
            ))?;
            let candidates = stmt
                .query_map(
                    params![user_id, key.payee_id, key.direction.as_str(), key.currency_id],
                    row_to_pattern,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            candidates
                .into_iter()
                .find(|p| {
                    (p.representative_amount - candidate.representative_amount).abs()
                        <= natural_key_tolerance(p.representative_amount)
                        && day_hints_match(p.day_of_month_hint, candidate.day_of_month_hint)
                })
                .map(|p| p.id)
        };

        let (pattern_id, created) = match existing_id {
            Some(id) => {
                tx.execute(
                    r#"
                    UPDATE patterns SET
                        interval_days = ?,
                        pattern_case = ?,
                        amount_behaviour = ?,
                        representative_amount = ?,
                        amount_min = ?,
                        amount_max = ?,
                        day_of_month_hint = ?,
                        confidence = ?,
                        annotation = COALESCE(?, annotation),
                        detection_version = detection_version + 1,
                        last_evaluated_at = ?
                    WHERE id = ?
                    "#,
                    params![
                        candidate.interval_days,
                        candidate.pattern_case.as_str(),
                        candidate.amount_behaviour.as_str(),
                        candidate.representative_amount.to_string(),
                        candidate.amount_min.to_string(),
                        candidate.amount_max.to_string(),
                        candidate.day_of_month_hint.map(|h| h as i64),
                        candidate.confidence,
                        annotation,
                        now,
                        id,
                    ],
                )?;
                debug!(pattern_id = id, "Refreshed existing pattern");
                (id, false)
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO patterns
                        (user_id, payee_id, direction, currency_id, interval_days,
                         pattern_case, amount_behaviour, representative_amount,
                         amount_min, amount_max, day_of_month_hint, status,
                         confidence, detection_version, annotation, last_evaluated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, 1, ?, ?)
                    "#,
                    params![
                        user_id,
                        key.payee_id,
                        key.direction.as_str(),
                        key.currency_id,
                        candidate.interval_days,
                        candidate.pattern_case.as_str(),
                        candidate.amount_behaviour.as_str(),
                        candidate.representative_amount.to_string(),
                        candidate.amount_min.to_string(),
                        candidate.amount_max.to_string(),
                        candidate.day_of_month_hint.map(|h| h as i64),
                        candidate.confidence,
                        annotation,
                        now,
                    ],
                )?;
                (tx.last_insert_rowid(), true)
            }
        };

        if created {
            // Seed the streak once; re-discovery never resets it
            tx.execute(
                r#"
                INSERT INTO pattern_streaks
                    (pattern_id, current_streak, longest_streak, missed_count,
                     last_actual_date, last_expected_date, confidence_multiplier)
                VALUES (?, ?, ?, 0, ?, ?, 1.0)
                "#,
                params![
                    pattern_id,
                    candidate.transactions.len() as i64,
                    candidate.transactions.len() as i64,
                    candidate.last_transaction_date.to_string(),
                    candidate.last_transaction_date.to_string(),
                ],
            )?;
        }

        // Links are append-only: absent rows are added, nothing is removed
        for txn in &candidate.transactions {
            tx.execute(
                "INSERT OR IGNORE INTO pattern_links (pattern_id, transaction_id) VALUES (?, ?)",
                params![pattern_id, txn.id],
            )?;
        }

        if created {
            let expected = obligation::next_expected_date(
                candidate.last_transaction_date,
                candidate.interval_days,
            );
            let tolerance =
                obligation::tolerance_days(candidate.pattern_case, candidate.interval_days);
            let (min_amount, max_amount) = obligation::estimate_amount_range(
                &candidate.recent_inlier_amounts,
                candidate.amount_behaviour,
                candidate.representative_amount,
            );

            tx.execute(
                r#"
                INSERT INTO obligations
                    (pattern_id, expected_date, tolerance_days,
                     expected_min_amount, expected_max_amount, status)
                VALUES (?, ?, ?, ?, ?, 'expected')
                "#,
                params![
                    pattern_id,
                    expected.to_string(),
                    tolerance,
                    min_amount.to_string(),
                    max_amount.to_string(),
                ],
            )?;
        }

        tx.commit()?;

        let pattern = self
            .get_pattern(pattern_id)?
            .ok_or_else(|| Error::Fatal(format!("Pattern {} vanished after commit", pattern_id)))?;

        Ok((pattern, created))
    }
}
