//! Telemetry: structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use speedline_core::telemetry::{init_telemetry, LoggingConfig, MetricsConfig};
//!
//! init_telemetry(&LoggingConfig::default(), &MetricsConfig::default())
//!     .expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, redact_url, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry, SyncMetrics};

/// Service name attached to metrics.
pub const SERVICE_NAME: &str = "speedline-server";

/// Initialize logging, then metrics.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(logging: &LoggingConfig, metrics: &MetricsConfig) -> anyhow::Result<()> {
    init_logging(logging)?;
    init_metrics(metrics, SERVICE_NAME)?;
    Ok(())
}
