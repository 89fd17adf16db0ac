//! State reconciliation.
//!
//! [`StateReconciler`] is the only writer of the shared document. Every
//! update runs the same pipeline under an exclusive lock:
//!
//! 1. compare the claimed version against the ledger (stale updates are
//!    answered with the current snapshot instead of being applied)
//! 2. merge the incoming document into the stored one
//! 3. persist the result, retrying transient storage failures
//! 4. advance the ledger and publish the new snapshot to the broadcast hub
//!
//! Reads share the lock, so they observe the state either before or after a
//! commit, never in between.

pub mod merge;
pub mod retry;

pub use merge::{reconcile, ChangeSet};
pub use retry::{BackoffStrategy, RetryPolicy};

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::config::SyncConfig;
use crate::document::{Document, Snapshot, UpdateRequest};
use crate::error::Result;
use crate::ledger::VersionLedger;
use crate::store::DocumentStore;
use crate::telemetry::SyncMetrics;
use crate::websocket::BroadcastHub;

/// Result of [`StateReconciler::apply`].
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// The update was persisted and published.
    Committed {
        snapshot: Snapshot,
        changes: ChangeSet,
    },
    /// The claimed version was too far behind; nothing changed.
    Conflict {
        current: Snapshot,
        claimed_version: u64,
    },
}

impl ApplyOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// The snapshot to show the caller: the new state or the current one.
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            Self::Committed { snapshot, .. } => snapshot,
            Self::Conflict { current, .. } => current,
        }
    }
}

/// Serializes commits against one store and publishes their results.
pub struct StateReconciler {
    store: Arc<dyn DocumentStore>,
    hub: Arc<BroadcastHub>,
    ledger: VersionLedger,
    lock: RwLock<()>,
    staleness_threshold: u64,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StateReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReconciler")
            .field("backend", &self.store.backend())
            .field("version", &self.ledger.current())
            .field("staleness_threshold", &self.staleness_threshold)
            .finish()
    }
}

impl StateReconciler {
    pub fn new(store: Arc<dyn DocumentStore>, hub: Arc<BroadcastHub>, config: &SyncConfig) -> Self {
        Self::with_policy(
            store,
            hub,
            config.staleness_threshold,
            RetryPolicy::from(&config.retry),
        )
    }

    pub fn with_policy(
        store: Arc<dyn DocumentStore>,
        hub: Arc<BroadcastHub>,
        staleness_threshold: u64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            hub,
            ledger: VersionLedger::new(),
            lock: RwLock::new(()),
            staleness_threshold,
            retry,
        }
    }

    /// Current ledger version.
    pub fn version(&self) -> u64 {
        self.ledger.current()
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Read the current document tagged with the current version.
    ///
    /// Never mutates anything and never advances the version.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let _guard = self.lock.read().await;
        let document = self.load().await?;
        Ok(Snapshot::new(document, self.ledger.current()))
    }

    /// Validate, merge, persist and publish an update.
    #[instrument(skip_all, fields(claimed_version = ?request.claimed_version))]
    pub async fn apply(&self, request: UpdateRequest) -> Result<ApplyOutcome> {
        let _guard = self.lock.write().await;
        let started = Instant::now();
        let current_version = self.ledger.current();

        if let Some(claimed) = request.claimed_version {
            let lag = self.ledger.lag(claimed);
            if lag > self.staleness_threshold {
                let document = self.load().await?;
                SyncMetrics::record_conflict(lag);
                info!(claimed, current_version, lag, "Rejected stale update");
                return Ok(ApplyOutcome::Conflict {
                    current: Snapshot::new(document, current_version),
                    claimed_version: claimed,
                });
            }
            if claimed > current_version {
                warn!(
                    claimed,
                    current_version,
                    "Client claims a version ahead of the ledger, accepting"
                );
            }
        }

        let current = self.load().await?;
        let (next, changes) = reconcile(&current, request.document, Utc::now())?;

        self.retry
            .run("replace", || self.store.replace(&next))
            .await?;

        let version = self.ledger.advance();

        // The commit already happened; a failed re-read falls back to what was written.
        let document = match self.load().await {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, version, "Reload after commit failed, publishing written document");
                next
            }
        };

        let snapshot = Snapshot::new(document, version);
        self.hub.publish(snapshot.clone());

        SyncMetrics::record_commit(&changes, started.elapsed());
        info!(
            version,
            lines = snapshot.document.lines.len(),
            people = snapshot.document.person_count(),
            inserted = changes.insertions(),
            deleted = changes.deletions(),
            "State committed"
        );

        Ok(ApplyOutcome::Committed { snapshot, changes })
    }

    async fn load(&self) -> Result<Document> {
        self.retry.run("load", || self.store.load()).await
    }
}
