//! Real-time push channel.
//!
//! This module provides:
//! - A broadcast hub that fans committed snapshots out to every subscriber
//! - The `/ws` connection handler with per-connection writer tasks
//! - The JSON event protocol spoken over the socket

mod broadcast;
mod handler;
mod message;

pub use broadcast::{BroadcastHub, ConnectionId, HubStats, Subscription};
pub use handler::ws_upgrade_handler;
pub use message::{ClientMessage, ServerMessage};

pub use crate::config::WebSocketConfig;
