//! Speedline CLI - Command-line client for the Speedline state server.
//!
//! Provides health, state, and configuration commands.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, state};
use output::OutputFormat;

/// Speedline - waiting-line state server CLI
#[derive(Parser)]
#[command(
    name = "speedline",
    version,
    about = "Speedline - waiting-line state server CLI",
    long_about = "Inspect, export and update the shared waiting-line document held by a Speedline server.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "SPEEDLINE_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health
    Health(health::HealthArgs),

    /// Shared document operations
    #[command(subcommand)]
    State(state::StateCommands),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::State(cmd) => state::execute(cmd, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
