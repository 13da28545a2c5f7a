//! Server API tests

use super::*;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use cadence_core::db::Database;
use http_body_util::BodyExt;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    db: Database,
    payee: i64,
    currency: i64,
}

fn setup_test_app() -> TestApp {
    let db = Database::in_memory().unwrap();
    db.upsert_user(1, "asha").unwrap();
    let payee = db.upsert_payee("Sabitha").unwrap();
    let currency = db.upsert_currency("INR").unwrap();
    let app = create_router(db.clone(), ServerConfig::default());
    TestApp {
        app,
        db,
        payee,
        currency,
    }
}

async fn get_body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", "1")
        .header("content-type", "application/json");
    match body {
        Some(json) => builder
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn ingest(
    t: &TestApp,
    date: &str,
    amount: f64,
    msg: &str,
) -> serde_json::Value {
    let response = t
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/api/transactions",
            Some(serde_json::json!({
                "payee_id": t.payee,
                "direction": "credit",
                "currency_id": t.currency,
                "occurred_at": format!("{}T09:00:00Z", date),
                "amount": amount,
                "source_message_id": msg,
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    get_body_json(response).await
}

#[tokio::test]
async fn test_missing_user_header_is_rejected() {
    let t = setup_test_app();

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/patterns")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health() {
    let t = setup_test_app();

    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_ingest_reports_duplicates() {
    let t = setup_test_app();

    let first = ingest(&t, "2025-10-31", 16500.0, "dup-check").await;
    assert_eq!(first["duplicate"], false);

    let second = ingest(&t, "2025-10-31", 16500.0, "dup-check").await;
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["transaction_id"], first["transaction_id"]);
}

#[tokio::test]
async fn test_discover_with_no_history_is_empty() {
    let t = setup_test_app();

    let response = t
        .app
        .clone()
        .oneshot(request("POST", "/api/patterns/discover", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response).await;
    assert!(json["patterns"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_full_discovery_flow() {
    let t = setup_test_app();
    ingest(&t, "2025-10-31", 16500.0, "s1").await;
    ingest(&t, "2025-12-01", 16500.0, "s2").await;
    ingest(&t, "2025-12-30", 16500.0, "s3").await;

    let response = t
        .app
        .clone()
        .oneshot(request("POST", "/api/patterns/discover", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = get_body_json(response).await;
    let patterns = json["patterns"].as_array().unwrap();
    assert_eq!(patterns.len(), 1);
    let pattern = &patterns[0]["pattern"];
    assert_eq!(pattern["pattern_case"], "fixed_monthly");
    assert_eq!(pattern["interval_days"], 30);
    assert_eq!(pattern["detection_version"], 1);

    let id = pattern["id"].as_i64().unwrap();

    // Listing includes the payee name and streak
    let response = t
        .app
        .clone()
        .oneshot(request("GET", "/api/patterns", None))
        .await
        .unwrap();
    let listed = get_body_json(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["payee"], "Sabitha");
    assert_eq!(listed[0]["streak"]["current_streak"], 3);

    // Detail carries the seeded obligation
    let response = t
        .app
        .clone()
        .oneshot(request("GET", &format!("/api/patterns/{}", id), None))
        .await
        .unwrap();
    let detail = get_body_json(response).await;
    let obligations = detail["recent_obligations"].as_array().unwrap();
    assert_eq!(obligations.len(), 1);
    assert_eq!(obligations[0]["expected_date"], "2026-01-29");
    assert_eq!(obligations[0]["tolerance_days"], 3);

    // Upcoming feed sees it too (the expected date is in the past by the
    // time tests run, which still counts as due)
    let response = t
        .app
        .clone()
        .oneshot(request("GET", "/api/obligations/upcoming?days=30", None))
        .await
        .unwrap();
    let upcoming = get_body_json(response).await;
    assert_eq!(upcoming.as_array().unwrap().len(), 1);
    assert_eq!(upcoming[0]["payee"], "Sabitha");
}

#[tokio::test]
async fn test_discovery_single_flight_releases_between_requests() {
    let t = setup_test_app();

    // The per-user guard is released at the end of each request, so
    // sequential discoveries never conflict
    for _ in 0..2 {
        let response = t
            .app
            .clone()
            .oneshot(request("POST", "/api/patterns/discover", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_pattern_lifecycle_actions() {
    let t = setup_test_app();
    ingest(&t, "2025-10-31", 16500.0, "s1").await;
    ingest(&t, "2025-12-01", 16500.0, "s2").await;
    ingest(&t, "2025-12-30", 16500.0, "s3").await;

    let response = t
        .app
        .clone()
        .oneshot(request("POST", "/api/patterns/discover", None))
        .await
        .unwrap();
    let json = get_body_json(response).await;
    let id = json["patterns"][0]["pattern"]["id"].as_i64().unwrap();

    // Pause
    let response = t
        .app
        .clone()
        .oneshot(request(
            "PATCH",
            &format!("/api/patterns/{}", id),
            Some(serde_json::json!({"action": "pause"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let pattern = t.db.get_pattern(id).unwrap().unwrap();
    assert_eq!(
        pattern.status,
        cadence_core::models::PatternStatus::Paused
    );

    // Unknown action is invalid
    let response = t
        .app
        .clone()
        .oneshot(request(
            "PATCH",
            &format!("/api/patterns/{}", id),
            Some(serde_json::json!({"action": "explode"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Delete without confirmation archives
    let response = t
        .app
        .clone()
        .oneshot(request("DELETE", &format!("/api/patterns/{}", id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let pattern = t.db.get_pattern(id).unwrap().unwrap();
    assert_eq!(
        pattern.status,
        cadence_core::models::PatternStatus::Archived
    );

    // Confirmed delete cascades for real
    let response = t
        .app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/api/patterns/{}?confirm=true", id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(t.db.get_pattern(id).unwrap().is_none());
}

#[tokio::test]
async fn test_foreign_pattern_is_invisible() {
    let t = setup_test_app();
    ingest(&t, "2025-10-31", 16500.0, "s1").await;
    ingest(&t, "2025-12-01", 16500.0, "s2").await;
    ingest(&t, "2025-12-30", 16500.0, "s3").await;

    let response = t
        .app
        .clone()
        .oneshot(request("POST", "/api/patterns/discover", None))
        .await
        .unwrap();
    let json = get_body_json(response).await;
    let id = json["patterns"][0]["pattern"]["id"].as_i64().unwrap();

    // A different caller cannot see it
    t.db.upsert_user(2, "rahul").unwrap();
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/patterns/{}", id))
                .header("x-user-id", "2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_status_filter_rejected() {
    let t = setup_test_app();

    let response = t
        .app
        .clone()
        .oneshot(request("GET", "/api/patterns?status=bogus", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
