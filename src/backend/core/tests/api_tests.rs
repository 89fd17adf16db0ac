//! Tests for the REST endpoints.
//!
//! Tests cover:
//! - Reading the current state
//! - Committing a document
//! - Version conflicts
//! - Malformed and invalid payloads
//! - Health and metrics endpoints

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use speedline_core::api::{build_router, AppState};
use speedline_core::document::UpdateRequest;
use speedline_core::store::MemoryStore;
use speedline_core::sync::{RetryPolicy, StateReconciler};
use speedline_core::websocket::{BroadcastHub, WebSocketConfig};
use std::sync::Arc;
use tower::ServiceExt;

// ============================================================================
// Helpers
// ============================================================================

fn setup() -> (Router, Arc<StateReconciler>) {
    let reconciler = Arc::new(StateReconciler::with_policy(
        Arc::new(MemoryStore::new()),
        Arc::new(BroadcastHub::new(16)),
        5,
        RetryPolicy::no_retry(),
    ));
    let app = build_router(AppState::new(reconciler.clone(), WebSocketConfig::default()));
    (app, reconciler)
}

async fn send(app: Router, method: Method, uri: &str, body: Option<String>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    let request = builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn post_state(app: Router, body: Value) -> (StatusCode, Value) {
    send(app, Method::POST, "/state", Some(body.to_string())).await
}

// ============================================================================
// GET /state
// ============================================================================

#[tokio::test]
async fn test_get_state_returns_defaults() {
    let (app, _) = setup();

    let (status, body) = send(app, Method::GET, "/state", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["version"], 0);
    assert_eq!(body["data"]["config"]["maxPeoplePerLine"], "10");
    assert_eq!(body["data"]["lines"], json!([]));
    assert_eq!(body["data"]["generalWaitQueue"], json!([]));
    assert!(body["data"]["timestamp"].is_string());
}

#[tokio::test]
async fn test_get_state_does_not_bump_version() {
    let (app, reconciler) = setup();

    send(app.clone(), Method::GET, "/state", None).await;
    send(app, Method::GET, "/state", None).await;

    assert_eq!(reconciler.version(), 0);
}

// ============================================================================
// POST /state
// ============================================================================

#[tokio::test]
async fn test_post_state_commits() {
    let (app, reconciler) = setup();

    let (status, body) = post_state(
        app,
        json!({
            "state": {
                "config": {"maxPeoplePerLine": 6},
                "lines": [{"name": "A", "time": "9:00", "people": [{"name": "Alice"}]}],
                "generalWaitQueue": []
            },
            "version": 0
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["version"], 1);
    assert_eq!(body["data"]["config"]["maxPeoplePerLine"], "6");
    assert_eq!(body["data"]["lines"][0]["name"], "A");
    assert_eq!(body["data"]["lines"][0]["people"][0]["name"], "Alice");
    assert!(body["data"]["lines"][0]["people"][0]["id"].is_i64());
    assert!(body["data"]["lines"][0]["people"][0]["createdAt"].is_string());
    assert_eq!(reconciler.version(), 1);
}

#[tokio::test]
async fn test_post_stale_version_conflicts() {
    let (app, reconciler) = setup();
    for _ in 0..7 {
        reconciler
            .apply(UpdateRequest::from_json(json!({"lines": [{"name": "A"}]})).unwrap())
            .await
            .unwrap();
    }

    let (status, body) = post_state(
        app,
        json!({"lines": [{"name": "B"}], "version": 1}),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "VERSION_CONFLICT");
    assert!(body["error"].is_string());
    assert_eq!(body["data"]["version"], 7);
    assert_eq!(body["data"]["lines"][0]["name"], "A");
    assert_eq!(reconciler.version(), 7);
}

#[tokio::test]
async fn test_post_malformed_json_is_bad_request() {
    let (app, reconciler) = setup();

    let (status, body) = send(
        app,
        Method::POST,
        "/state",
        Some("{\"lines\": [".to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "INVALID_JSON");
    assert_eq!(reconciler.version(), 0);
}

#[tokio::test]
async fn test_post_invalid_document_is_unprocessable() {
    let (app, reconciler) = setup();

    let (status, body) = post_state(app, json!({"lines": [{"name": ""}]})).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");
    assert_eq!(body["error_info"]["details"]["field"], "lines[0].name");
    assert_eq!(reconciler.version(), 0);
}

#[tokio::test]
async fn test_post_person_in_two_containers_is_rejected() {
    let (app, _) = setup();

    let (status, body) = post_state(
        app,
        json!({
            "lines": [{"name": "A", "people": [{"id": 4, "name": "Eve"}]}],
            "generalWaitQueue": [{"id": 4, "name": "Eve"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_post_non_object_is_rejected() {
    let (app, _) = setup();

    let (status, _) = post_state(app, json!([1, 2, 3])).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

// ============================================================================
// Health and Metrics
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let (app, reconciler) = setup();
    reconciler
        .apply(UpdateRequest::from_json(json!({"lines": []})).unwrap())
        .await
        .unwrap();

    let (status, body) = send(app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["state_version"], 1);
    assert_eq!(body["storage"], "memory");
    assert_eq!(body["subscribers"]["active_subscribers"], 0);
    assert_eq!(body["subscribers"]["publishes"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint_responds() {
    let (app, _) = setup();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}
