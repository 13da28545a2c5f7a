//! Transaction and reference-table operations

use std::collections::HashSet;
use std::str::FromStr;

use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

use super::{format_datetime, parse_amount, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{Currency, Direction, NewTransaction, Payee, Transaction};

/// Result of inserting a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionInsertResult {
    Inserted(i64),
    /// A row with the same source_message_id already exists; upstream
    /// guarantees uniqueness, so a repeat is a replay, not an error.
    Duplicate(i64),
}

impl TransactionInsertResult {
    pub fn id(&self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) => *id,
        }
    }
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let direction_str: String = row.get(3)?;
    let occurred_at_str: String = row.get(5)?;
    let amount_str: String = row.get(6)?;
    let created_at_str: String = row.get(8)?;

    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        payee_id: row.get(2)?,
        direction: Direction::from_str(&direction_str).unwrap_or(Direction::Debit),
        currency_id: row.get(4)?,
        occurred_at: parse_datetime(&occurred_at_str),
        amount: parse_amount(&amount_str),
        source_message_id: row.get(7)?,
        created_at: parse_datetime(&created_at_str),
    })
}

const TRANSACTION_COLUMNS: &str = "id, user_id, payee_id, direction, currency_id, \
     occurred_at, amount, source_message_id, created_at";

impl Database {
    /// Insert a transaction, reporting a duplicate when the
    /// source_message_id has been seen before
    pub fn insert_transaction(&self, tx: &NewTransaction) -> Result<TransactionInsertResult> {
        if tx.amount < Decimal::ZERO {
            return Err(Error::Invalid(format!(
                "Transaction amount must be non-negative, got {}",
                tx.amount
            )));
        }

        let conn = self.conn()?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM transactions WHERE source_message_id = ?",
                params![tx.source_message_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(TransactionInsertResult::Duplicate(id));
        }

        conn.execute(
            r#"
            INSERT INTO transactions
                (user_id, payee_id, direction, currency_id, occurred_at, amount, source_message_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                tx.user_id,
                tx.payee_id,
                tx.direction.as_str(),
                tx.currency_id,
                format_datetime(tx.occurred_at),
                tx.amount.to_string(),
                tx.source_message_id,
            ],
        )?;

        Ok(TransactionInsertResult::Inserted(conn.last_insert_rowid()))
    }

    /// Get a transaction by id
    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                &format!("SELECT {} FROM transactions WHERE id = ?", TRANSACTION_COLUMNS),
                params![id],
                row_to_transaction,
            )
            .optional()?;

        Ok(result)
    }

    /// List a user's transactions, newest first
    pub fn list_transactions(&self, user_id: i64, limit: i64) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE user_id = ? \
             ORDER BY occurred_at DESC LIMIT ?",
            TRANSACTION_COLUMNS
        ))?;

        let transactions = stmt
            .query_map(params![user_id, limit], row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(transactions)
    }

    /// All of a user's transactions, oldest first, for discovery grouping
    pub fn list_transactions_for_discovery(&self, user_id: i64) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE user_id = ? ORDER BY occurred_at ASC",
            TRANSACTION_COLUMNS
        ))?;

        let transactions = stmt
            .query_map(params![user_id], row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(transactions)
    }

    /// When the most recent transaction on a key occurred, if any
    pub fn latest_occurrence_for_key(
        &self,
        user_id: i64,
        payee_id: i64,
        direction: Direction,
        currency_id: i64,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let conn = self.conn()?;
        let result: Option<String> = conn
            .query_row(
                "SELECT occurred_at FROM transactions \
                 WHERE user_id = ? AND payee_id = ? AND direction = ? AND currency_id = ? \
                 ORDER BY occurred_at DESC LIMIT 1",
                params![user_id, payee_id, direction.as_str(), currency_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result.map(|s| parse_datetime(&s)))
    }

    /// Transaction ids already linked to any pattern sharing the given key
    pub fn linked_transaction_ids_for_key(
        &self,
        user_id: i64,
        payee_id: i64,
        direction: Direction,
        currency_id: i64,
    ) -> Result<HashSet<i64>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT pl.transaction_id
            FROM pattern_links pl
            JOIN patterns p ON p.id = pl.pattern_id
            WHERE p.user_id = ? AND p.payee_id = ? AND p.direction = ? AND p.currency_id = ?
            "#,
        )?;

        let ids = stmt
            .query_map(
                params![user_id, payee_id, direction.as_str(), currency_id],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<std::result::Result<HashSet<_>, _>>()?;

        Ok(ids)
    }

    /// Amounts of the most recent transactions linked to a pattern,
    /// newest first
    pub fn recent_linked_amounts(&self, pattern_id: i64, limit: i64) -> Result<Vec<Decimal>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT t.amount
            FROM transactions t
            JOIN pattern_links pl ON pl.transaction_id = t.id
            WHERE pl.pattern_id = ?
            ORDER BY t.occurred_at DESC
            LIMIT ?
            "#,
        )?;

        let amounts = stmt
            .query_map(params![pattern_id, limit], |row| {
                let s: String = row.get(0)?;
                Ok(parse_amount(&s))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(amounts)
    }

    // ========== Reference tables ==========

    /// Insert a user if absent, returning its id
    pub fn upsert_user(&self, id: i64, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, name) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![id, name],
        )?;
        Ok(id)
    }

    /// Insert a payee by name if absent, returning its id
    pub fn upsert_payee(&self, name: &str) -> Result<i64> {
        let conn = self.conn()?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM payees WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }

        conn.execute("INSERT INTO payees (name) VALUES (?)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_payee(&self, id: i64) -> Result<Option<Payee>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, name FROM payees WHERE id = ?",
                params![id],
                |row| {
                    Ok(Payee {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Insert a currency by code if absent, returning its id
    pub fn upsert_currency(&self, code: &str) -> Result<i64> {
        let conn = self.conn()?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM currencies WHERE code = ?",
                params![code],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }

        conn.execute("INSERT INTO currencies (code) VALUES (?)", params![code])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_currency(&self, id: i64) -> Result<Option<Currency>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, code FROM currencies WHERE id = ?",
                params![id],
                |row| {
                    Ok(Currency {
                        id: row.get(0)?,
                        code: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }
}
