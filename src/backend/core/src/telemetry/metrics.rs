//! Prometheus metrics for commits, conflicts, storage retries and fan-out.
//!
//! # Example
//!
//! ```rust,no_run
//! use speedline_core::telemetry::metrics::SyncMetrics;
//!
//! SyncMetrics::record_conflict(6);
//! SyncMetrics::set_subscribers(3);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use crate::sync::ChangeSet;

/// Global metrics registry.
static METRICS_REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

/// Holds the Prometheus handle used to render `/metrics`.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Get the global metrics registry. Renders nothing until [`init_metrics`] ran.
    pub fn global() -> &'static MetricsRegistry {
        METRICS_REGISTRY.get_or_init(|| MetricsRegistry {
            prometheus_handle: None,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder and publish it as the global registry.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<()> {
    if !config.enabled {
        tracing::info!("Metrics disabled");
        return Ok(());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    if METRICS_REGISTRY
        .set(MetricsRegistry {
            prometheus_handle: Some(handle),
        })
        .is_err()
    {
        tracing::warn!("Metrics registry was read before initialization; /metrics stays empty");
    }

    tracing::info!(service_name = %service_name, "Metrics initialized");
    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!("speedline_commits_total", "Successful document commits");
    describe_counter!(
        "speedline_conflicts_total",
        "Updates rejected because the claimed version was stale"
    );
    describe_histogram!(
        "speedline_conflict_lag_versions",
        "How many versions a rejected update trailed by"
    );
    describe_counter!(
        "speedline_storage_retries_total",
        "Storage operations retried after a transient failure"
    );
    describe_counter!(
        "speedline_changes_total",
        "Entities touched by commits, by kind"
    );
    describe_histogram!(
        "speedline_commit_duration_seconds",
        "Time from lock acquisition to published commit"
    );
    describe_counter!("speedline_broadcasts_total", "Snapshots published to subscribers");
    describe_counter!(
        "speedline_deliveries_total",
        "Snapshots written to connections"
    );
    describe_counter!(
        "speedline_subscribers_dropped_total",
        "Connections dropped because they were too slow"
    );
    describe_gauge!("speedline_subscribers", "Currently connected subscribers");
    describe_counter!("speedline_errors_total", "Errors by code and category");
}

/// Recording helpers for the synchronization core.
pub struct SyncMetrics;

impl SyncMetrics {
    pub fn record_commit(changes: &ChangeSet, duration: Duration) {
        counter!("speedline_commits_total").increment(1);
        histogram!("speedline_commit_duration_seconds").record(duration.as_secs_f64());

        for (kind, count) in changes.counts() {
            if count > 0 {
                counter!("speedline_changes_total", "kind" => kind).increment(count as u64);
            }
        }
    }

    pub fn record_conflict(lag: u64) {
        counter!("speedline_conflicts_total").increment(1);
        histogram!("speedline_conflict_lag_versions").record(lag as f64);
    }

    pub fn record_storage_retry(operation: &'static str) {
        counter!("speedline_storage_retries_total", "operation" => operation).increment(1);
    }

    pub fn record_broadcast() {
        counter!("speedline_broadcasts_total").increment(1);
    }

    pub fn record_delivery() {
        counter!("speedline_deliveries_total").increment(1);
    }

    pub fn record_dropped_subscriber(reason: &'static str) {
        counter!("speedline_subscribers_dropped_total", "reason" => reason).increment(1);
    }

    pub fn set_subscribers(count: usize) {
        gauge!("speedline_subscribers").set(count as f64);
    }
}
