//! HTTP surface for the Speedline server.
//!
//! Routes:
//! - `GET  /state`   current document and version
//! - `POST /state`   submit a document
//! - `GET  /ws`      push channel
//! - `GET  /health`  liveness, ledger version and hub statistics
//! - `GET  /metrics` Prometheus text format

mod handlers;

pub use handlers::HealthResponse;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::error::SyncError;
use crate::sync::StateReconciler;
use crate::websocket::{self, BroadcastHub, WebSocketConfig};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<StateReconciler>,
    pub hub: Arc<BroadcastHub>,
    pub websocket: WebSocketConfig,
}

impl AppState {
    /// Build the state around a reconciler, sharing its broadcast hub.
    pub fn new(reconciler: Arc<StateReconciler>, websocket: WebSocketConfig) -> Self {
        let hub = reconciler.hub().clone();
        Self {
            reconciler,
            hub,
            websocket,
        }
    }
}

/// Build the API router.
///
/// # Example
///
/// ```rust,ignore
/// let state = AppState::new(reconciler, config.websocket.clone());
/// let app = build_router(state);
/// ```
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/state", get(handlers::get_state).post(handlers::post_state))
        .route("/ws", get(websocket::ws_upgrade_handler))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn from_sync_error(err: &SyncError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.user_message().to_string()),
            error_code: Some(err.error_code().to_string()),
        }
    }
}
