//! Speedline Server - Main entry point

use clap::Parser;
use std::sync::Arc;

use speedline_core::{
    api::{self, AppState},
    config::Config,
    store,
    sync::StateReconciler,
    telemetry,
    websocket::BroadcastHub,
};

#[derive(Parser, Debug)]
#[command(name = "speedline-server", version, about = "Speedline state synchronization server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "SPEEDLINE_CONFIG")]
    config: Option<String>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Logging is not up yet, so a broken config is reported once telemetry is.
    let (mut config, config_error) = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
        None => match Config::load() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    telemetry::init_telemetry(&config.logging, &config.metrics)?;

    if let Some(e) = config_error {
        tracing::warn!(error = %e, "Could not load configuration, using defaults");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.storage.backend,
        "Starting Speedline server"
    );

    let store = store::open(&config.storage).await?;
    let hub = Arc::new(BroadcastHub::new(config.websocket.channel_capacity));
    let reconciler = Arc::new(StateReconciler::new(store, hub, &config.sync));

    // The ledger starts at zero on every boot; clients holding older numbers
    // from a previous run are only checked against the staleness window.
    tracing::info!(
        staleness_threshold = config.sync.staleness_threshold,
        "Version ledger initialized"
    );

    let app = api::build_router(AppState::new(reconciler, config.websocket.clone()));

    let addr = config.bind_address();
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
