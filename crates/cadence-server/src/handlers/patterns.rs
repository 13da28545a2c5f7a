//! Pattern discovery and lifecycle handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{require_user_id, AppError, AppState, SuccessResponse, MAX_PAGE_LIMIT};
use cadence_core::discovery::{DiscoveryFilters, DiscoveryOutcome, PatternDiscovery};
use cadence_core::models::{
    Direction, Obligation, Pattern, PatternStatus, PatternStreak,
};

/// Pattern plus its runtime companions for API responses
#[derive(Serialize)]
pub struct PatternView {
    #[serde(flatten)]
    pub pattern: Pattern,
    pub payee: Option<String>,
    pub streak: Option<PatternStreak>,
}

fn pattern_view(state: &AppState, pattern: Pattern) -> Result<PatternView, AppError> {
    let payee = state.db.get_payee(pattern.payee_id)?.map(|p| p.name);
    let streak = state.db.get_streak(pattern.id)?;
    Ok(PatternView {
        pattern,
        payee,
        streak,
    })
}

/// Fetch a pattern and verify it belongs to the caller
fn owned_pattern(state: &AppState, user_id: i64, pattern_id: i64) -> Result<Pattern, AppError> {
    let pattern = state
        .db
        .get_pattern(pattern_id)?
        .filter(|p| p.user_id == user_id)
        .ok_or_else(|| AppError::not_found("Pattern not found"))?;
    Ok(pattern)
}

/// Discovery request parameters
#[derive(Debug, Deserialize, Default)]
pub struct DiscoverRequest {
    pub payee_id: Option<i64>,
    pub direction: Option<Direction>,
}

/// POST /api/patterns/discover - Run the discovery path for the caller
///
/// Serialised per user: a second request while one is in flight returns a
/// conflict rather than racing the upsert.
pub async fn discover_patterns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<DiscoverRequest>>,
) -> Result<Json<DiscoveryOutcome>, AppError> {
    let user_id = require_user_id(&headers)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let Some(_guard) = state.discovery_flight.try_begin(user_id) else {
        return Err(AppError::conflict("Discovery already running for this user"));
    };

    let filters = DiscoveryFilters {
        payee_id: request.payee_id,
        direction: request.direction,
    };

    let outcome = PatternDiscovery::new(&state.db)
        .with_summariser(state.summariser.as_ref())
        .discover_for_user(user_id, &filters)?;

    info!(
        user_id,
        patterns = outcome.patterns.len(),
        skipped = outcome.skipped.len(),
        "Discovery request complete"
    );

    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ListPatternsQuery {
    pub status: Option<String>,
}

/// GET /api/patterns - List the caller's patterns
pub async fn list_patterns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListPatternsQuery>,
) -> Result<Json<Vec<PatternView>>, AppError> {
    let user_id = require_user_id(&headers)?;

    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<PatternStatus>()
                .map_err(|e| AppError::bad_request(&e))
        })
        .transpose()?;

    let patterns = state.db.list_patterns(user_id, status)?;
    let views = patterns
        .into_iter()
        .map(|p| pattern_view(&state, p))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
pub struct GetPatternQuery {
    pub obligations: Option<i64>,
}

/// Pattern detail: the row, its streak, and recent obligations
#[derive(Serialize)]
pub struct PatternDetail {
    #[serde(flatten)]
    pub view: PatternView,
    pub recent_obligations: Vec<Obligation>,
}

/// GET /api/patterns/:id - Pattern, streak, and its last N obligations
pub async fn get_pattern(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<GetPatternQuery>,
) -> Result<Json<PatternDetail>, AppError> {
    let user_id = require_user_id(&headers)?;
    let pattern = owned_pattern(&state, user_id, id)?;

    let limit = query.obligations.unwrap_or(10).clamp(1, MAX_PAGE_LIMIT);
    let recent_obligations = state.db.list_obligations(id, None, limit)?;
    let view = pattern_view(&state, pattern)?;

    Ok(Json(PatternDetail {
        view,
        recent_obligations,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePatternRequest {
    pub action: String,
}

/// PATCH /api/patterns/:id - Pause, resume, or archive a pattern
pub async fn update_pattern(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(request): Json<UpdatePatternRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user_id = require_user_id(&headers)?;
    owned_pattern(&state, user_id, id)?;

    match request.action.as_str() {
        "pause" => state.db.set_pattern_status(id, PatternStatus::Paused)?,
        "resume" => state.db.set_pattern_status(id, PatternStatus::Active)?,
        "archive" => {
            state.db.set_pattern_status(id, PatternStatus::Archived)?;
            state.db.cancel_pending_obligations(id)?;
        }
        other => {
            return Err(AppError::bad_request(&format!(
                "Unknown action '{}' (expected pause, resume, or archive)",
                other
            )))
        }
    }

    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Debug, Deserialize)]
pub struct DeletePatternQuery {
    pub confirm: Option<bool>,
}

/// DELETE /api/patterns/:id - Archive by default; hard-delete with
/// `confirm=true`, cascading to streak, obligations, and links
pub async fn delete_pattern(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<DeletePatternQuery>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user_id = require_user_id(&headers)?;
    owned_pattern(&state, user_id, id)?;

    if query.confirm == Some(true) {
        state.db.delete_pattern(id)?;
        info!(pattern_id = id, user_id, "Pattern hard-deleted");
    } else {
        state.db.set_pattern_status(id, PatternStatus::Archived)?;
        state.db.cancel_pending_obligations(id)?;
        info!(pattern_id = id, user_id, "Pattern archived");
    }

    Ok(Json(SuccessResponse { success: true }))
}
