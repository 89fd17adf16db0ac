//! Fan-out of committed snapshots to every connected subscriber.
//!
//! Publishing never blocks: snapshots go into a bounded broadcast channel and
//! each connection drains its own receiver on its own task. Only the newest
//! document matters, so a receiver that falls behind skips straight to the
//! latest snapshot instead of replaying the ones it missed.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;
use uuid::Uuid;

use crate::document::Snapshot;
use crate::telemetry::SyncMetrics;

/// Unique identifier for a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statistics about the hub.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub active_subscribers: usize,
    pub total_subscriptions: u64,
    pub publishes: u64,
    pub deliveries: u64,
    /// Snapshots skipped by receivers that fell behind
    pub lagged: u64,
    /// Subscribers disconnected for being too slow
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_subscriptions: AtomicU64,
    publishes: AtomicU64,
    deliveries: AtomicU64,
    lagged: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone)]
struct SubscriberInfo {
    connected_at: DateTime<Utc>,
}

/// The broadcast hub.
pub struct BroadcastHub {
    sender: broadcast::Sender<Arc<Snapshot>>,
    subscribers: RwLock<HashMap<ConnectionId, SubscriberInfo>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl BroadcastHub {
    /// Create a hub whose receivers buffer up to `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Register a new subscriber.
    ///
    /// The subscription only sees snapshots published after this call; the
    /// caller is expected to send the current snapshot right away.
    pub fn subscribe(&self) -> Subscription {
        let id = ConnectionId::new();
        let receiver = self.sender.subscribe();

        let active = {
            let mut subscribers = self.subscribers.write();
            subscribers.insert(
                id,
                SubscriberInfo {
                    connected_at: Utc::now(),
                },
            );
            subscribers.len()
        };

        self.counters.total_subscriptions.fetch_add(1, Ordering::Relaxed);
        SyncMetrics::set_subscribers(active);
        debug!(connection_id = %id, active, "Subscriber added");

        Subscription {
            id,
            receiver,
            counters: self.counters.clone(),
        }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: ConnectionId) {
        let (removed, active) = {
            let mut subscribers = self.subscribers.write();
            let removed = subscribers.remove(&id);
            (removed, subscribers.len())
        };

        if let Some(info) = removed {
            SyncMetrics::set_subscribers(active);
            debug!(
                connection_id = %id,
                active,
                connected_secs = (Utc::now() - info.connected_at).num_seconds(),
                "Subscriber removed"
            );
        }
    }

    /// Push a snapshot to every current subscriber. Returns how many receivers got it.
    pub fn publish(&self, snapshot: Snapshot) -> usize {
        let version = snapshot.version;
        let receivers = self.sender.send(Arc::new(snapshot)).unwrap_or(0);

        self.counters.publishes.fetch_add(1, Ordering::Relaxed);
        SyncMetrics::record_broadcast();
        debug!(version, receivers, "Snapshot published");

        receivers
    }

    /// Record that a snapshot reached a connection.
    pub fn record_delivery(&self) {
        self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
        SyncMetrics::record_delivery();
    }

    /// Record that a connection was dropped for being too slow.
    pub fn record_dropped(&self, reason: &'static str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        SyncMetrics::record_dropped_subscriber(reason);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_subscribed(&self, id: ConnectionId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_subscribers: self.subscriber_count(),
            total_subscriptions: self.counters.total_subscriptions.load(Ordering::Relaxed),
            publishes: self.counters.publishes.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            lagged: self.counters.lagged.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// One subscriber's view of the published snapshots.
pub struct Subscription {
    id: ConnectionId,
    receiver: broadcast::Receiver<Arc<Snapshot>>,
    counters: Arc<Counters>,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the next snapshot. Returns `None` once the hub is gone.
    ///
    /// After falling behind, older buffered snapshots are discarded and only
    /// the newest one is returned.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    self.counters.lagged.fetch_add(skipped, Ordering::Relaxed);
                    debug!(connection_id = %self.id, skipped, "Subscriber lagged");
                    if let Some(latest) = self.drain_to_latest() {
                        return Some(latest);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn drain_to_latest(&mut self) -> Option<Arc<Snapshot>> {
        let mut latest = None;
        loop {
            match self.receiver.try_recv() {
                Ok(snapshot) => {
                    if latest.is_some() {
                        self.counters.lagged.fetch_add(1, Ordering::Relaxed);
                    }
                    latest = Some(snapshot);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    self.counters.lagged.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return latest,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn snapshot(version: u64) -> Snapshot {
        Snapshot::new(Document::default(), version)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = BroadcastHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.publish(snapshot(1)), 2);

        assert_eq!(a.next().await.unwrap().version, 1);
        assert_eq!(b.next().await.unwrap().version, 1);

        let stats = hub.stats();
        assert_eq!(stats.active_subscribers, 2);
        assert_eq!(stats.total_subscriptions, 2);
        assert_eq!(stats.publishes, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_fail() {
        let hub = BroadcastHub::new(8);
        assert_eq!(hub.publish(snapshot(1)), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_to_latest() {
        let hub = BroadcastHub::new(2);
        let mut slow = hub.subscribe();

        for version in 1..=6 {
            hub.publish(snapshot(version));
        }

        assert_eq!(slow.next().await.unwrap().version, 6);
        assert!(hub.stats().lagged >= 4);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = BroadcastHub::new(8);
        let sub = hub.subscribe();
        assert!(hub.is_subscribed(sub.id()));

        hub.unsubscribe(sub.id());
        assert!(!hub.is_subscribed(sub.id()));
        assert_eq!(hub.subscriber_count(), 0);

        // Removing twice is harmless.
        hub.unsubscribe(sub.id());
    }

    #[tokio::test]
    async fn test_closed_hub_ends_subscription() {
        let hub = BroadcastHub::new(8);
        let mut sub = hub.subscribe();
        drop(hub);
        assert!(sub.next().await.is_none());
    }
}
