//! Ingest-notify handlers
//!
//! The ingestion pipeline persists transactions through this surface and
//! the matcher is notified asynchronously. Responses return as soon as the
//! row is durable; matching happens in the background with bounded retries
//! and a dead-letter landing zone.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{require_user_id, AppError, AppState, MAX_PAGE_LIMIT};
use cadence_core::db::TransactionInsertResult;
use cadence_core::matcher::spawn_match;
use cadence_core::models::{DeadLetter, Direction, NewTransaction, Transaction};

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub payee_id: i64,
    pub direction: Direction,
    pub currency_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub amount: Decimal,
    pub source_message_id: String,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub transaction_id: i64,
    /// The source message had been ingested before; nothing new happened
    pub duplicate: bool,
    /// Clock anomaly: future-dated or arriving well out of order;
    /// accepted and matched by its date regardless
    pub flagged: bool,
}

/// POST /api/transactions - Persist a transaction and notify the matcher
pub async fn ingest_transaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let user_id = require_user_id(&headers)?;

    // Clock anomalies are accepted but flagged: dated in the future, or
    // arriving more than a day before the key's latest transaction
    let mut flagged = request.occurred_at > Utc::now() + Duration::days(1);
    if !flagged {
        if let Some(latest) = state.db.latest_occurrence_for_key(
            user_id,
            request.payee_id,
            request.direction,
            request.currency_id,
        )? {
            flagged = request.occurred_at + Duration::days(1) < latest;
        }
    }
    if flagged {
        warn!(
            occurred_at = %request.occurred_at,
            "Accepting transaction with anomalous date; flagging"
        );
    }

    let result = state.db.insert_transaction(&NewTransaction {
        user_id,
        payee_id: request.payee_id,
        direction: request.direction,
        currency_id: request.currency_id,
        occurred_at: request.occurred_at,
        amount: request.amount,
        source_message_id: request.source_message_id,
    })?;

    let (transaction_id, duplicate) = match result {
        TransactionInsertResult::Inserted(id) => {
            // Matcher work is async; the per-key lock serialises it
            spawn_match(Arc::clone(&state.matcher), id);
            (id, false)
        }
        TransactionInsertResult::Duplicate(id) => {
            info!(transaction_id = id, "Duplicate source message replayed");
            (id, true)
        }
    };

    Ok(Json(IngestResponse {
        transaction_id,
        duplicate,
        flagged,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    pub limit: Option<i64>,
}

/// GET /api/transactions - The caller's transactions, newest first
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<Vec<Transaction>>, AppError> {
    let user_id = require_user_id(&headers)?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_LIMIT);
    let transactions = state.db.list_transactions(user_id, limit)?;
    Ok(Json(transactions))
}

/// GET /api/dead-letters - Matcher work that exhausted its retries
pub async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    require_user_id(&headers)?;
    let letters = state.db.list_dead_letters(100)?;
    Ok(Json(letters))
}
