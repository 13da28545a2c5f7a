//! Obligation lifecycle operations and the dead-letter store
//!
//! Obligation transitions for one pattern are strictly linearly ordered:
//! the pending `expected` row is always resolved to `fulfilled` or `missed`
//! before the next one is created, and both composite operations here do
//! the resolve-and-roll inside a single transaction.

use std::str::FromStr;

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::patterns::PATTERN_COLUMNS;
use super::{format_datetime, parse_amount, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{DeadLetter, Obligation, ObligationStatus, Pattern, PatternStatus, Transaction};

/// Fields for rolling the next expected obligation
#[derive(Debug, Clone)]
pub struct NewObligation {
    pub expected_date: NaiveDate,
    pub tolerance_days: i64,
    pub expected_min_amount: Option<Decimal>,
    pub expected_max_amount: Option<Decimal>,
}

const OBLIGATION_COLUMNS: &str = "id, pattern_id, expected_date, tolerance_days, expected_min_amount, \
     expected_max_amount, status, fulfilled_by_transaction_id, fulfilled_at, days_early, created_at";

fn row_to_obligation(row: &Row<'_>) -> rusqlite::Result<Obligation> {
    let expected_str: String = row.get(2)?;
    let min_str: Option<String> = row.get(4)?;
    let max_str: Option<String> = row.get(5)?;
    let status_str: String = row.get(6)?;
    let fulfilled_at_str: Option<String> = row.get(8)?;
    let created_str: String = row.get(10)?;

    Ok(Obligation {
        id: row.get(0)?,
        pattern_id: row.get(1)?,
        expected_date: super::parse_date(&expected_str).unwrap_or_default(),
        tolerance_days: row.get(3)?,
        expected_min_amount: min_str.map(|s| parse_amount(&s)),
        expected_max_amount: max_str.map(|s| parse_amount(&s)),
        status: ObligationStatus::from_str(&status_str).unwrap_or(ObligationStatus::Expected),
        fulfilled_by_transaction_id: row.get(7)?,
        fulfilled_at: fulfilled_at_str.map(|s| parse_datetime(&s)),
        days_early: row.get(9)?,
        created_at: parse_datetime(&created_str),
    })
}

fn insert_obligation(tx: &rusqlite::Transaction<'_>, pattern_id: i64, next: &NewObligation) -> rusqlite::Result<i64> {
    tx.execute(
        r#"
        INSERT INTO obligations
            (pattern_id, expected_date, tolerance_days,
             expected_min_amount, expected_max_amount, status)
        VALUES (?, ?, ?, ?, ?, 'expected')
        "#,
        params![
            pattern_id,
            next.expected_date.to_string(),
            next.tolerance_days,
            next.expected_min_amount.map(|a| a.to_string()),
            next.expected_max_amount.map(|a| a.to_string()),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

impl Database {
    /// Get an obligation by id
    pub fn get_obligation(&self, id: i64) -> Result<Option<Obligation>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM obligations WHERE id = ?", OBLIGATION_COLUMNS),
                params![id],
                row_to_obligation,
            )
            .optional()?;
        Ok(result)
    }

    /// The pending `expected` obligation for a pattern, if any
    ///
    /// At rest there is exactly one; the earliest wins if an inconsistency
    /// ever produces more.
    pub fn pending_obligation(&self, pattern_id: i64) -> Result<Option<Obligation>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM obligations \
                     WHERE pattern_id = ? AND status = 'expected' \
                     ORDER BY expected_date ASC, id ASC LIMIT 1",
                    OBLIGATION_COLUMNS
                ),
                params![pattern_id],
                row_to_obligation,
            )
            .optional()?;
        Ok(result)
    }

    /// Obligation history for a pattern, newest first
    pub fn list_obligations(
        &self,
        pattern_id: i64,
        status: Option<ObligationStatus>,
        limit: i64,
    ) -> Result<Vec<Obligation>> {
        let conn = self.conn()?;

        let obligations = if let Some(status) = status {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM obligations WHERE pattern_id = ? AND status = ? \
                 ORDER BY expected_date DESC, id DESC LIMIT ?",
                OBLIGATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![pattern_id, status.as_str(), limit], row_to_obligation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM obligations WHERE pattern_id = ? \
                 ORDER BY expected_date DESC, id DESC LIMIT ?",
                OBLIGATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![pattern_id, limit], row_to_obligation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        Ok(obligations)
    }

    /// Pending obligations across a user's patterns due within `days`,
    /// soonest first; already-overdue rows are included
    pub fn upcoming_obligations(
        &self,
        user_id: i64,
        days: i64,
    ) -> Result<Vec<(Obligation, Pattern)>> {
        let cutoff = Utc::now().date_naive() + Duration::days(days);
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {}, {} FROM obligations o \
             JOIN patterns p ON p.id = o.pattern_id \
             WHERE p.user_id = ? AND o.status = 'expected' AND o.expected_date <= ? \
             ORDER BY o.expected_date ASC, o.id ASC",
            OBLIGATION_COLUMNS
                .split(", ")
                .map(|c| format!("o.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
            PATTERN_COLUMNS
                .split(", ")
                .map(|c| format!("p.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
        ))?;

        let rows = stmt
            .query_map(params![user_id, cutoff.to_string()], |row| {
                let obligation = row_to_obligation(row)?;
                let pattern = pattern_at_offset(row, 11)?;
                Ok((obligation, pattern))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Resolve the pending obligation as fulfilled and roll the next one
    ///
    /// One transaction covers the obligation transition, the link row, the
    /// streak update, the pattern status, and the rolled obligation. A
    /// successful match is also the recovery path: missed_count resets and
    /// paused/broken patterns return to active.
    pub fn apply_fulfilment(
        &self,
        pattern: &Pattern,
        obligation: &Obligation,
        transaction: &Transaction,
        next: &NewObligation,
    ) -> Result<Obligation> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = format_datetime(Utc::now());
        let days_early = (obligation.expected_date - transaction.date()).num_days();

        let changed = tx.execute(
            r#"
            UPDATE obligations SET
                status = 'fulfilled',
                fulfilled_by_transaction_id = ?,
                fulfilled_at = ?,
                days_early = ?
            WHERE id = ? AND status = 'expected'
            "#,
            params![transaction.id, now, days_early, obligation.id],
        )?;
        if changed == 0 {
            return Err(Error::Conflict(format!(
                "Obligation {} is no longer pending",
                obligation.id
            )));
        }

        tx.execute(
            "INSERT OR IGNORE INTO pattern_links (pattern_id, transaction_id) VALUES (?, ?)",
            params![pattern.id, transaction.id],
        )?;

        tx.execute(
            r#"
            UPDATE pattern_streaks SET
                current_streak = current_streak + 1,
                longest_streak = MAX(longest_streak, current_streak + 1),
                missed_count = 0,
                last_actual_date = ?,
                last_expected_date = ?,
                confidence_multiplier = MIN(1.0, confidence_multiplier + 0.05),
                updated_at = ?
            WHERE pattern_id = ?
            "#,
            params![
                transaction.date().to_string(),
                obligation.expected_date.to_string(),
                now,
                pattern.id,
            ],
        )?;

        tx.execute(
            "UPDATE patterns SET status = 'active', last_evaluated_at = ? WHERE id = ?",
            params![now, pattern.id],
        )?;

        let next_id = insert_obligation(&tx, pattern.id, next)?;
        tx.commit()?;

        debug!(
            pattern_id = pattern.id,
            obligation_id = obligation.id,
            transaction_id = transaction.id,
            days_early,
            "Obligation fulfilled"
        );

        self.get_obligation(next_id)?
            .ok_or_else(|| Error::Fatal(format!("Obligation {} vanished after commit", next_id)))
    }

    /// Resolve the pending obligation as missed and roll the next one
    ///
    /// The caller decides the degraded pattern status from the new miss
    /// count; streak counters and the confidence multiplier decay here.
    pub fn apply_miss(
        &self,
        pattern_id: i64,
        obligation_id: i64,
        new_status: PatternStatus,
        next: &NewObligation,
    ) -> Result<Obligation> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = format_datetime(Utc::now());

        let changed = tx.execute(
            "UPDATE obligations SET status = 'missed' WHERE id = ? AND status = 'expected'",
            params![obligation_id],
        )?;
        if changed == 0 {
            return Err(Error::Conflict(format!(
                "Obligation {} is no longer pending",
                obligation_id
            )));
        }

        tx.execute(
            r#"
            UPDATE pattern_streaks SET
                missed_count = missed_count + 1,
                current_streak = 0,
                confidence_multiplier = MAX(0.0, confidence_multiplier - 0.15),
                updated_at = ?
            WHERE pattern_id = ?
            "#,
            params![now, pattern_id],
        )?;

        tx.execute(
            "UPDATE patterns SET status = ?, last_evaluated_at = ? WHERE id = ?",
            params![new_status.as_str(), now, pattern_id],
        )?;

        let next_id = insert_obligation(&tx, pattern_id, next)?;
        tx.commit()?;

        debug!(
            pattern_id,
            obligation_id,
            status = new_status.as_str(),
            "Obligation missed"
        );

        self.get_obligation(next_id)?
            .ok_or_else(|| Error::Fatal(format!("Obligation {} vanished after commit", next_id)))
    }

    /// Create a replacement obligation for a pattern that lost its pending
    /// one; logs the repair
    pub fn create_repair_obligation(
        &self,
        pattern_id: i64,
        next: &NewObligation,
    ) -> Result<Obligation> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let next_id = insert_obligation(&tx, pattern_id, next)?;
        tx.commit()?;

        warn!(
            pattern_id,
            expected_date = %next.expected_date,
            "Repaired pattern without a pending obligation"
        );

        self.get_obligation(next_id)?
            .ok_or_else(|| Error::Fatal(format!("Obligation {} vanished after commit", next_id)))
    }

    /// Cancel every pending obligation of a pattern (soft archive path)
    pub fn cancel_pending_obligations(&self, pattern_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE obligations SET status = 'cancelled' WHERE pattern_id = ? AND status = 'expected'",
            params![pattern_id],
        )?;
        Ok(changed)
    }

    // ========== Dead letters ==========

    /// Record matcher work that exhausted its retry budget; never dropped
    pub fn record_dead_letter(
        &self,
        transaction_id: i64,
        attempts: i64,
        last_error: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO dead_letters (transaction_id, attempts, last_error) VALUES (?, ?, ?)",
            params![transaction_id, attempts, last_error],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List dead letters, newest first
    pub fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, transaction_id, attempts, last_error, created_at \
             FROM dead_letters ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let created_str: String = row.get(4)?;
                Ok(DeadLetter {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    attempts: row.get(2)?,
                    last_error: row.get(3)?,
                    created_at: parse_datetime(&created_str),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Map the pattern half of a joined obligation+pattern row
fn pattern_at_offset(row: &Row<'_>, o: usize) -> rusqlite::Result<Pattern> {
    use crate::models::{AmountBehaviour, Direction, PatternCase};

    let direction_str: String = row.get(o + 3)?;
    let case_str: String = row.get(o + 6)?;
    let behaviour_str: String = row.get(o + 7)?;
    let representative_str: String = row.get(o + 8)?;
    let min_str: String = row.get(o + 9)?;
    let max_str: String = row.get(o + 10)?;
    let hint: Option<i64> = row.get(o + 11)?;
    let status_str: String = row.get(o + 12)?;
    let last_evaluated_str: String = row.get(o + 16)?;
    let created_str: String = row.get(o + 17)?;

    Ok(Pattern {
        id: row.get(o)?,
        user_id: row.get(o + 1)?,
        payee_id: row.get(o + 2)?,
        direction: Direction::from_str(&direction_str).unwrap_or(Direction::Debit),
        currency_id: row.get(o + 4)?,
        interval_days: row.get(o + 5)?,
        pattern_case: PatternCase::from_str(&case_str).unwrap_or(PatternCase::CustomInterval),
        amount_behaviour: AmountBehaviour::from_str(&behaviour_str)
            .unwrap_or(AmountBehaviour::Variable),
        representative_amount: parse_amount(&representative_str),
        amount_min: parse_amount(&min_str),
        amount_max: parse_amount(&max_str),
        day_of_month_hint: hint.map(|h| h as u32),
        status: PatternStatus::from_str(&status_str).unwrap_or(PatternStatus::Active),
        confidence: row.get(o + 13)?,
        detection_version: row.get(o + 14)?,
        annotation: row.get(o + 15)?,
        last_evaluated_at: parse_datetime(&last_evaluated_str),
        created_at: parse_datetime(&created_str),
    })
}
