#![allow(clippy::result_large_err)]
//! # Speedline Core
//!
//! Real-time state synchronization for waiting lines.
//!
//! Every client holds a copy of one shared document: a configuration, a set
//! of named lines with the people waiting in them, and a general wait queue.
//! Clients submit whole documents; the server merges them into durable
//! storage, stamps the result with a monotonically increasing version and
//! pushes it to every connected client.
//!
//! ## Architecture
//!
//! - **Document**: the canonical model plus lenient parsing of client payloads
//! - **Store**: persistence behind one trait (memory, JSON file, PostgreSQL)
//! - **Sync**: the reconciler that diffs, persists, versions and publishes
//! - **Ledger**: the process-wide version counter
//! - **WebSocket**: broadcast hub and the `/ws` push channel
//! - **API**: REST endpoints, health and Prometheus metrics
//! - **Telemetry**: structured logging and metrics

pub mod api;
pub mod config;
pub mod document;
pub mod error;
pub mod ledger;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod websocket;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, SyncError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{build_router, ApiResponse, AppState};
    pub use crate::config::Config;
    pub use crate::document::{
        Document, DocumentConfig, IncomingDocument, Line, Person, Snapshot, UpdateRequest,
    };
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, SyncError};
    pub use crate::ledger::VersionLedger;
    pub use crate::store::{DocumentStore, JsonFileStore, MemoryStore, PgDocumentStore};
    pub use crate::sync::{ApplyOutcome, ChangeSet, RetryPolicy, StateReconciler};
    pub use crate::websocket::{BroadcastHub, ClientMessage, ConnectionId, ServerMessage};
}
