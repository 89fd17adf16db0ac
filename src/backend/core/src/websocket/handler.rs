//! WebSocket connection handler.
//!
//! Each connection runs two tasks: the reader below, which parses client
//! events and talks to the reconciler, and a writer that merges direct
//! replies with snapshots from the broadcast hub. A writer that cannot push a
//! frame within the send timeout gives up, which closes the connection
//! without holding up anybody else.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::broadcast::{BroadcastHub, ConnectionId, Subscription};
use super::message::{ClientMessage, ServerMessage};
use crate::api::AppState;
use crate::document::UpdateRequest;
use crate::sync::ApplyOutcome;

/// Handle WebSocket upgrade request.
pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max_message_size = state.websocket.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle an individual WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();

    let hub = state.hub.clone();
    let subscription = hub.subscribe();
    let conn_id = subscription.id();
    info!(connection_id = %conn_id, "WebSocket connection opened");

    // Direct replies to this connection only
    let (tx, rx) = mpsc::channel::<ServerMessage>(state.websocket.channel_capacity.max(1));

    // The subscription exists before this read, so no commit can slip between them.
    let initial = match state.reconciler.snapshot().await {
        Ok(snapshot) => ServerMessage::state(snapshot),
        Err(e) => {
            e.log();
            ServerMessage::from(&e)
        }
    };
    let _ = tx.send(initial).await;

    let mut writer = tokio::spawn(write_loop(
        ws_sender,
        rx,
        subscription,
        hub.clone(),
        state.websocket.send_timeout,
    ));

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, conn_id, &state, &tx).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let _ = tx.send(invalid_message("Binary frames are not supported")).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection_id = %conn_id, "Client requested close");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection_id = %conn_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }

            _ = &mut writer => {
                debug!(connection_id = %conn_id, "Writer finished");
                break;
            }
        }
    }

    writer.abort();
    hub.unsubscribe(conn_id);
    info!(connection_id = %conn_id, "WebSocket connection closed");
}

/// Forward direct replies and published snapshots to the socket.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
    mut subscription: Subscription,
    hub: Arc<BroadcastHub>,
    send_timeout: Duration,
) {
    let conn_id = subscription.id();
    let mut last_version: Option<u64> = None;

    loop {
        let (msg, from_hub) = tokio::select! {
            biased;

            direct = rx.recv() => match direct {
                Some(msg) => (msg, false),
                None => break,
            },

            published = subscription.next() => match published {
                Some(snapshot) => (ServerMessage::StateUpdated(snapshot), true),
                None => break,
            },
        };

        // Never step a client back to an older document.
        if let ServerMessage::StateUpdated(snapshot) = &msg {
            let stale = match last_version {
                Some(sent) if from_hub => snapshot.version <= sent,
                Some(sent) => snapshot.version < sent,
                None => false,
            };
            if stale {
                continue;
            }
            last_version = Some(snapshot.version);
        }

        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(connection_id = %conn_id, error = %e, event = msg.message_type(), "Failed to serialize message");
                continue;
            }
        };

        match tokio::time::timeout(send_timeout, ws_sender.send(Message::Text(json))).await {
            Ok(Ok(())) => {
                if from_hub {
                    hub.record_delivery();
                }
            }
            Ok(Err(e)) => {
                debug!(connection_id = %conn_id, error = %e, "WebSocket send failed");
                break;
            }
            Err(_) => {
                warn!(
                    connection_id = %conn_id,
                    timeout_ms = send_timeout.as_millis() as u64,
                    "Subscriber too slow, disconnecting"
                );
                hub.record_dropped("send_timeout");
                break;
            }
        }
    }
}

/// Handle a message from the client.
async fn handle_client_message(
    text: &str,
    conn_id: ConnectionId,
    state: &AppState,
    tx: &mpsc::Sender<ServerMessage>,
) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(connection_id = %conn_id, error = %e, "Unparseable client message");
            let _ = tx.send(invalid_message(format!("Invalid message format: {e}"))).await;
            return;
        }
    };

    let reply = match msg {
        ClientMessage::GetState => match state.reconciler.snapshot().await {
            Ok(snapshot) => Some(ServerMessage::state(snapshot)),
            Err(e) => {
                e.log();
                Some(ServerMessage::from(&e))
            }
        },

        ClientMessage::StateSaved { state: document, version } => {
            let result = match UpdateRequest::from_event(document, version) {
                Ok(request) => state.reconciler.apply(request).await,
                Err(e) => Err(e),
            };

            match result {
                // Everybody, this connection included, hears about it from the hub.
                Ok(ApplyOutcome::Committed { snapshot, .. }) => {
                    debug!(connection_id = %conn_id, version = snapshot.version, "State saved");
                    None
                }
                Ok(ApplyOutcome::Conflict {
                    current,
                    claimed_version,
                }) => Some(ServerMessage::conflict(current, claimed_version)),
                Err(e) => {
                    e.log();
                    Some(ServerMessage::from(&e))
                }
            }
        }

        ClientMessage::Ping { timestamp } => Some(ServerMessage::pong(timestamp)),
    };

    if let Some(reply) = reply {
        let _ = tx.send(reply).await;
    }
}

fn invalid_message(message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        code: "INVALID_MESSAGE".to_string(),
        message: message.into(),
        field: None,
    }
}
