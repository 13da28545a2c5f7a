//! Cadence Web Server
//!
//! Axum-based REST API over the pattern discovery and obligation tracking
//! core. Identity is an upstream concern: every request carries the
//! caller's user id in the `x-user-id` header, placed there by the
//! identity subsystem in front of this service.

use std::sync::Arc;

use axum::{
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use cadence_core::db::Database;
use cadence_core::locks::{KeyedLocks, SingleFlight};
use cadence_core::matcher::{MatchConfig, TransactionMatcher};
use cadence_core::summarise::{PatternSummariser, TemplateSummariser};

mod handlers;

/// Maximum pagination limit
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Header carrying the authenticated caller's user id
const USER_ID_HEADER: &str = "x-user-id";

/// Server configuration
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Allowed CORS origins (empty = same-origin only)
    pub allowed_origins: Vec<String>,
}

/// Shared application state
pub struct AppState {
    pub db: Database,
    pub config: ServerConfig,
    /// Serialises discovery per user; concurrent requests get a conflict
    pub discovery_flight: Arc<SingleFlight>,
    /// Runtime matcher with its per-key locks
    pub matcher: Arc<TransactionMatcher>,
    /// Advisory pattern annotations
    pub summariser: Arc<dyn PatternSummariser>,
}

/// Extract the caller's user id from request headers
pub fn require_user_id(headers: &HeaderMap) -> Result<i64, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| AppError::bad_request("Missing or invalid x-user-id header"))
}

/// Success response
#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Create the application router
pub fn create_router(db: Database, config: ServerConfig) -> Router {
    let locks = KeyedLocks::new();
    let matcher = Arc::new(TransactionMatcher::with_config(
        db.clone(),
        locks,
        MatchConfig::default(),
    ));

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        discovery_flight: SingleFlight::new(),
        matcher,
        summariser: Arc::new(TemplateSummariser),
    });

    let api_routes = Router::new()
        // Discovery
        .route("/patterns/discover", post(handlers::discover_patterns))
        // Patterns
        .route("/patterns", get(handlers::list_patterns))
        .route(
            "/patterns/:id",
            get(handlers::get_pattern)
                .patch(handlers::update_pattern)
                .delete(handlers::delete_pattern),
        )
        .route(
            "/patterns/:id/obligations",
            get(handlers::list_pattern_obligations),
        )
        // Obligations
        .route("/obligations/upcoming", get(handlers::upcoming_obligations))
        // Ingest-notify path
        .route(
            "/transactions",
            get(handlers::list_transactions).post(handlers::ingest_transaction),
        )
        // Inspection
        .route("/dead-letters", get(handlers::list_dead_letters))
        .with_state(state);

    // Restrictive CORS by default; origins are opt-in
    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE])
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE])
    };

    Router::new()
        .route("/health", get(health))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<SuccessResponse> {
    Json(SuccessResponse { success: true })
}

/// Start serving on the given address
pub async fn serve(db: Database, config: ServerConfig, host: &str, port: u16) -> anyhow::Result<()> {
    let router = create_router(db, config);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Cadence server listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

// ============================================================================
// Error Handling
// ============================================================================

/// Application error with an HTTP status and a sanitized message
pub struct AppError {
    status: StatusCode,
    message: String,
    internal: Option<String>,
}

impl AppError {
    pub fn bad_request(msg: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.to_string(),
            internal: None,
        }
    }

    pub fn not_found(msg: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.to_string(),
            internal: None,
        }
    }

    pub fn conflict(msg: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.to_string(),
            internal: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(internal) = &self.internal {
            error!(error = %internal, "Internal error");
        }

        let body = Json(serde_json::json!({
            "error": self.message
        }));

        (self.status, body).into_response()
    }
}

impl From<cadence_core::Error> for AppError {
    fn from(err: cadence_core::Error) -> Self {
        use cadence_core::Error;

        match err {
            Error::NotFound(msg) => Self {
                status: StatusCode::NOT_FOUND,
                message: msg,
                internal: None,
            },
            Error::Invalid(msg) => Self {
                status: StatusCode::BAD_REQUEST,
                message: msg,
                internal: None,
            },
            Error::Conflict(msg) => Self {
                status: StatusCode::CONFLICT,
                message: msg,
                internal: None,
            },
            Error::Retryable(msg) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "Temporarily unavailable, retry later".to_string(),
                internal: Some(msg),
            },
            // Storage and invariant failures stay generic to the client
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "An internal error occurred".to_string(),
                internal: Some(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests;
