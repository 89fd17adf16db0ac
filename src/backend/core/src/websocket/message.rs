//! WebSocket message types and serialization.
//!
//! Every frame is a JSON object tagged by `event`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::document::Snapshot;
use crate::error::SyncError;

// ═══════════════════════════════════════════════════════════════════════════════
// Client Messages (Client -> Server)
// ═══════════════════════════════════════════════════════════════════════════════

/// Messages sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for the current snapshot
    GetState,

    /// Submit a full document
    StateSaved {
        state: Value,
        /// Checked when the update is parsed, like a REST body's version
        #[serde(default)]
        version: Option<Value>,
    },

    /// Ping to keep connection alive
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server Messages (Server -> Client)
// ═══════════════════════════════════════════════════════════════════════════════

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A snapshot, either on connect, on request or after a commit
    StateUpdated(Arc<Snapshot>),

    /// The submitted version was too old; carries the current state
    Conflict {
        current: Snapshot,
        claimed_version: u64,
        current_version: u64,
        message: String,
    },

    /// The submitted message could not be processed
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        server_timestamp: i64,
    },
}

impl ServerMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::StateUpdated(_) => "state_updated",
            Self::Conflict { .. } => "conflict",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
        }
    }

    pub fn state(snapshot: impl Into<Arc<Snapshot>>) -> Self {
        Self::StateUpdated(snapshot.into())
    }

    pub fn conflict(current: Snapshot, claimed_version: u64) -> Self {
        let current_version = current.version;
        Self::Conflict {
            message: format!(
                "Version {claimed_version} is too old, the current version is {current_version}"
            ),
            current,
            claimed_version,
            current_version,
        }
    }

    pub fn pong(timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp,
            server_timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&SyncError> for ServerMessage {
    fn from(error: &SyncError) -> Self {
        Self::Error {
            code: error.error_code().to_string(),
            message: error.user_message().to_string(),
            field: error.details().field.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use serde_json::json;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(r#"{"event":"get_state"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GetState));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"event":"state_saved","state":{"lines":[]},"version":3}"#)
                .unwrap();
        match msg {
            ClientMessage::StateSaved { state, version } => {
                assert_eq!(state, json!({"lines": []}));
                assert_eq!(version, Some(json!(3)));
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping { timestamp: None }));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_state_updated_flattens_snapshot() {
        let msg = ServerMessage::state(Snapshot::new(Document::default(), 4));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["event"], "state_updated");
        assert_eq!(value["version"], 4);
        assert_eq!(value["config"]["maxPeoplePerLine"], "10");
        assert!(value["lines"].is_array());
    }

    #[test]
    fn test_conflict_message() {
        let msg = ServerMessage::conflict(Snapshot::new(Document::default(), 9), 2);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["event"], "conflict");
        assert_eq!(value["claimed_version"], 2);
        assert_eq!(value["current_version"], 9);
        assert_eq!(value["current"]["version"], 9);
    }

    #[test]
    fn test_error_from_sync_error() {
        let err = SyncError::invalid_field("lines[0].name", "Line name must not be empty");
        let value = serde_json::to_value(ServerMessage::from(&err)).unwrap();

        assert_eq!(value["event"], "error");
        assert_eq!(value["code"], "VALIDATION_ERROR");
        assert_eq!(value["field"], "lines[0].name");
    }
}
