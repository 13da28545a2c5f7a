//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `transactions` - Transaction facts and reference rows (users, payees, currencies)
//! - `patterns` - Patterns, streaks, links, and the discovery persistence path
//! - `obligations` - Obligation lifecycle and the dead-letter store

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::Result;

mod obligations;
mod patterns;
mod transactions;

pub use obligations::NewObligation;
pub use transactions::TransactionInsertResult;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Parse a SQLite datetime string into a DateTime<Utc>
///
/// SQLite stores as "YYYY-MM-DD HH:MM:SS" format.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Parse a TEXT amount column back into a Decimal
///
/// Amounts are stored as text to preserve precision; a row that fails to
/// parse is corrupt and surfaces as zero rather than panicking mid-query.
pub(crate) fn parse_amount(s: &str) -> Decimal {
    s.parse().unwrap_or_default()
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    db_path: String,
}

impl Database {
    /// Create a new database connection pool at the given path
    pub fn new(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });
        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database for testing
    ///
    /// Uses a temporary file rather than `:memory:` because each pooled
    /// connection would otherwise see its own empty in-memory database.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = format!(
            "{}/cadence_test_{}_{}.db",
            std::env::temp_dir().display(),
            std::process::id(),
            id
        );

        let _ = std::fs::remove_file(&path);

        Self::new(&path)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block writers; creates -wal/-shm sidecars
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Reference tables owned by the ingestion/identity pipeline;
            -- the core only reads names for display.
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS payees (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS currencies (
                id INTEGER PRIMARY KEY,
                code TEXT NOT NULL UNIQUE
            );

            -- Immutable transaction facts. Amounts are TEXT to preserve
            -- decimal precision.
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                payee_id INTEGER NOT NULL REFERENCES payees(id),
                direction TEXT NOT NULL,              -- debit, credit
                currency_id INTEGER NOT NULL REFERENCES currencies(id),
                occurred_at DATETIME NOT NULL,
                amount TEXT NOT NULL,
                source_message_id TEXT NOT NULL UNIQUE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_key
                ON transactions(user_id, payee_id, direction, currency_id);
            CREATE INDEX IF NOT EXISTS idx_transactions_occurred
                ON transactions(occurred_at);

            -- Discovered patterns. Several rows may share the same
            -- (user, payee, direction, currency) key - one per series.
            CREATE TABLE IF NOT EXISTS patterns (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                payee_id INTEGER NOT NULL REFERENCES payees(id),
                direction TEXT NOT NULL,
                currency_id INTEGER NOT NULL REFERENCES currencies(id),
                interval_days INTEGER NOT NULL,
                pattern_case TEXT NOT NULL,
                amount_behaviour TEXT NOT NULL,
                representative_amount TEXT NOT NULL,
                amount_min TEXT NOT NULL,
                amount_max TEXT NOT NULL,
                day_of_month_hint INTEGER,
                status TEXT NOT NULL DEFAULT 'active',
                confidence REAL NOT NULL,
                detection_version INTEGER NOT NULL DEFAULT 1,
                annotation TEXT,
                last_evaluated_at DATETIME NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_patterns_key
                ON patterns(user_id, payee_id, direction, currency_id);
            CREATE INDEX IF NOT EXISTS idx_patterns_status ON patterns(status);

            -- Runtime streak state, 1:1 with a pattern
            CREATE TABLE IF NOT EXISTS pattern_streaks (
                pattern_id INTEGER PRIMARY KEY REFERENCES patterns(id) ON DELETE CASCADE,
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                missed_count INTEGER NOT NULL DEFAULT 0,
                last_actual_date DATE,
                last_expected_date DATE,
                confidence_multiplier REAL NOT NULL DEFAULT 1.0,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Append-only transaction<->pattern links; never deleted except
            -- by an explicit hard delete of the whole pattern.
            CREATE TABLE IF NOT EXISTS pattern_links (
                pattern_id INTEGER NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
                transaction_id INTEGER NOT NULL REFERENCES transactions(id),
                linked_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (pattern_id, transaction_id)
            );

            CREATE INDEX IF NOT EXISTS idx_pattern_links_transaction
                ON pattern_links(transaction_id);

            -- Expected/fulfilled/missed occurrences; terminal rows persist
            -- for history.
            CREATE TABLE IF NOT EXISTS obligations (
                id INTEGER PRIMARY KEY,
                pattern_id INTEGER NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
                expected_date DATE NOT NULL,
                tolerance_days INTEGER NOT NULL,
                expected_min_amount TEXT,
                expected_max_amount TEXT,
                status TEXT NOT NULL DEFAULT 'expected',
                fulfilled_by_transaction_id INTEGER REFERENCES transactions(id),
                fulfilled_at DATETIME,
                days_early INTEGER,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_obligations_pattern_expected
                ON obligations(pattern_id, expected_date);
            CREATE INDEX IF NOT EXISTS idx_obligations_status ON obligations(status);

            -- Matcher work that exhausted its retry budget; never dropped
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
