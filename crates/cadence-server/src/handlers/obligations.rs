//! Obligation query handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{require_user_id, AppError, AppState, MAX_PAGE_LIMIT};
use cadence_core::models::{Obligation, ObligationStatus};

#[derive(Debug, Deserialize)]
pub struct ObligationsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/patterns/:id/obligations - Obligation history for a pattern
pub async fn list_pattern_obligations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ObligationsQuery>,
) -> Result<Json<Vec<Obligation>>, AppError> {
    let user_id = require_user_id(&headers)?;

    state
        .db
        .get_pattern(id)?
        .filter(|p| p.user_id == user_id)
        .ok_or_else(|| AppError::not_found("Pattern not found"))?;

    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<ObligationStatus>()
                .map_err(|e| AppError::bad_request(&e))
        })
        .transpose()?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_LIMIT);

    let obligations = state.db.list_obligations(id, status, limit)?;
    Ok(Json(obligations))
}

#[derive(Debug, Deserialize)]
pub struct UpcomingQuery {
    pub days: Option<i64>,
}

/// A pending obligation with enough pattern context to render a reminder
#[derive(Serialize)]
pub struct UpcomingObligation {
    #[serde(flatten)]
    pub obligation: Obligation,
    pub pattern_id: i64,
    pub payee: Option<String>,
    pub pattern_case: String,
}

/// GET /api/obligations/upcoming?days=N - Pending obligations across the
/// caller's patterns due within N days, soonest first
pub async fn upcoming_obligations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<UpcomingQuery>,
) -> Result<Json<Vec<UpcomingObligation>>, AppError> {
    let user_id = require_user_id(&headers)?;
    let days = query.days.unwrap_or(30).clamp(0, 3650);

    let rows = state.db.upcoming_obligations(user_id, days)?;
    let mut upcoming = Vec::with_capacity(rows.len());
    for (obligation, pattern) in rows {
        let payee = state.db.get_payee(pattern.payee_id)?.map(|p| p.name);
        upcoming.push(UpcomingObligation {
            obligation,
            pattern_id: pattern.id,
            payee,
            pattern_case: pattern.pattern_case.to_string(),
        });
    }

    Ok(Json(upcoming))
}
