//! Shared document commands.
//!
//! Provides show, export and push operations against `/state`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tabled::Tabled;

use crate::client::{ApiClient, ClientError};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum StateCommands {
    /// Show lines, people and the general wait queue
    Show,

    /// Write the current document as JSON
    Export {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Submit a document from a JSON file
    Push {
        /// Path to the document
        file: PathBuf,

        /// Version the document was based on
        #[arg(long)]
        version: Option<u64>,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct PersonView {
    id: i64,
    name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
struct LineView {
    name: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    people: Vec<PersonView>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotView {
    version: u64,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    lines: Vec<LineView>,
    #[serde(default)]
    general_wait_queue: Vec<PersonView>,
}

#[derive(Debug, Serialize, Tabled)]
struct LineRow {
    #[tabled(rename = "Line")]
    name: String,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "People")]
    people: String,
}

#[derive(Debug, Serialize, Tabled)]
struct PersonRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Waiting")]
    waiting: String,
}

fn line_rows(snapshot: &SnapshotView) -> Vec<LineRow> {
    let capacity = snapshot
        .config
        .get("maxPeoplePerLine")
        .and_then(Value::as_str)
        .unwrap_or("10");

    snapshot
        .lines
        .iter()
        .map(|line| LineRow {
            name: line.name.clone(),
            time: line.time.clone(),
            size: format!("{}/{}", line.people.len(), capacity),
            people: line
                .people
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect()
}

fn queue_rows(queue: &[PersonView], now: DateTime<Utc>) -> Vec<PersonRow> {
    queue
        .iter()
        .enumerate()
        .map(|(i, p)| PersonRow {
            position: i + 1,
            id: p.id,
            name: p.name.clone(),
            waiting: output::format_wait(p.created_at, now),
        })
        .collect()
}

/// Drop the server timestamp so an export can be pushed back unchanged.
fn exportable(mut snapshot: Value) -> Value {
    if let Some(obj) = snapshot.as_object_mut() {
        obj.remove("timestamp");
    }
    snapshot
}

/// Attach a claimed version to a document body, wrapped or bare.
fn with_version(mut body: Value, version: Option<u64>) -> Result<Value> {
    let obj = body
        .as_object_mut()
        .context("Document must be a JSON object")?;
    if let Some(version) = version {
        obj.insert("version".to_string(), Value::from(version));
    }
    Ok(body)
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: StateCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        StateCommands::Show => {
            let raw: Value = client.get("/state").await?;

            match format {
                OutputFormat::Table => {
                    let snapshot: SnapshotView =
                        serde_json::from_value(raw).context("Unexpected state shape")?;

                    output::print_header(&format!("Lines (version {})", snapshot.version));
                    output::print_list(&line_rows(&snapshot), format)?;

                    output::print_header("General wait queue");
                    output::print_list(&queue_rows(&snapshot.general_wait_queue, Utc::now()), format)?;
                }
                _ => output::print_item(&raw, format)?,
            }
        }

        StateCommands::Export { file } => {
            let raw: Value = client.get("/state").await?;
            let json = serde_json::to_string_pretty(&exportable(raw))?;

            match file {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    output::print_success(&format!("State exported to {}", path.display()));
                }
                None => println!("{}", json),
            }
        }

        StateCommands::Push { file, version } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let body: Value = serde_json::from_str(&content)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;
            let body = with_version(body, version)?;

            let committed: Value = match client.post("/state", &body).await {
                Ok(committed) => committed,
                Err(e) => {
                    if let Some(ClientError::Conflict {
                        current_version,
                        current,
                        ..
                    }) = e.downcast_ref::<ClientError>()
                    {
                        output::print_warning(&format!(
                            "Server is at version {}; export the current state and retry",
                            current_version
                        ));
                        if !matches!(format, OutputFormat::Table) {
                            output::print_item(current, format)?;
                        }
                    }
                    return Err(e);
                }
            };

            match format {
                OutputFormat::Table => {
                    let version = committed.get("version").and_then(Value::as_u64).unwrap_or(0);
                    output::print_success(&format!("State committed at version {}", version));
                }
                _ => output::print_item(&committed, format)?,
            }
        }
    }

    Ok(())
}
