//! API request handlers with proper error propagation.
//!
//! Handlers return `Result<impl IntoResponse, SyncError>` so that errors are
//! converted to the right HTTP status by the `IntoResponse` implementation
//! on `SyncError`.

use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::Value;

use super::{ApiResponse, AppState};
use crate::document::{Snapshot, UpdateRequest};
use crate::error::{Result, SyncError};
use crate::sync::ApplyOutcome;
use crate::telemetry::MetricsRegistry;
use crate::websocket::HubStats;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub state_version: u64,
    pub storage: &'static str,
    pub subscribers: HubStats,
    pub metrics_enabled: bool,
    pub timestamp: String,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        state_version: state.reconciler.version(),
        storage: state.reconciler.backend(),
        subscribers: state.hub.stats(),
        metrics_enabled: MetricsRegistry::global().is_enabled(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// State Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// `GET /state`: the current document with its version.
pub async fn get_state(State(state): State<AppState>) -> Result<Json<ApiResponse<Snapshot>>> {
    let snapshot = state.reconciler.snapshot().await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// `POST /state`: submit a full document.
///
/// The body is parsed by hand so malformed JSON maps to a 400 with the
/// regular error envelope instead of axum's plain-text rejection.
pub async fn post_state(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let value: Value = serde_json::from_slice(&body).map_err(SyncError::from)?;
    let request = UpdateRequest::from_json(value)?;

    let response = match state.reconciler.apply(request).await? {
        ApplyOutcome::Committed { snapshot, .. } => {
            (StatusCode::OK, Json(ApiResponse::success(snapshot)))
        }
        ApplyOutcome::Conflict {
            current,
            claimed_version,
        } => {
            let conflict = SyncError::version_conflict(claimed_version, current.version);
            (
                StatusCode::CONFLICT,
                Json(ApiResponse {
                    data: Some(current),
                    ..ApiResponse::from_sync_error(&conflict)
                }),
            )
        }
    };

    Ok(response)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn prometheus_metrics() -> impl IntoResponse {
    let body = MetricsRegistry::global().render();

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
