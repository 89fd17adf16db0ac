//! Health check command.
//!
//! Queries the `/health` endpoint and displays server and subscriber status.

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include broadcast hub statistics
    #[arg(short, long)]
    detailed: bool,
}

fn field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.get_raw("/health").await?;

    match format {
        OutputFormat::Table => {
            let status = field(&health, "status");

            output::print_header("Server Health");
            output::print_detail("Status", &status);
            output::print_detail("API URL", client.base_url());
            output::print_detail("Version", &field(&health, "version"));
            output::print_detail("State version", &field(&health, "state_version"));
            output::print_detail("Storage", &field(&health, "storage"));
            output::print_detail("Timestamp", &field(&health, "timestamp"));

            if let Some(hub) = health.get("subscribers") {
                output::print_detail("Subscribers", &field(hub, "active_subscribers"));

                if args.detailed {
                    output::print_header("Broadcast Hub");
                    for key in [
                        "total_subscriptions",
                        "publishes",
                        "deliveries",
                        "lagged",
                        "dropped",
                    ] {
                        output::print_detail(key, &field(hub, key));
                    }
                }
            }

            if status == "healthy" {
                output::print_success("Server operational");
            } else {
                output::print_error(&format!("Server status: {}", status));
            }
        }
        _ => output::print_item(&health, format)?,
    }

    Ok(())
}
