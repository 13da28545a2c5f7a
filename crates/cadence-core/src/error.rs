//! Error types for Cadence

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    Invalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Retryable: {0}")]
    Retryable(String),

    /// A core invariant was violated, e.g. a pattern left without an
    /// expected obligation that the repair path could not restore.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the operation that produced this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Pool(_) | Error::Retryable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
