//! CLI settings kept in `~/.speedline/config.toml`.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::output::{self, OutputFormat};

const API_URL_KEY: &str = "api-url";

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a value (known keys: api-url)
    Set { key: String, value: String },

    /// Print a single value
    Get { key: String },

    /// Show every stored value
    Show,

    /// Delete the settings file
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl CliConfig {
    fn get(&self, key: &str) -> Result<Option<&str>> {
        match key {
            API_URL_KEY => Ok(self.api_url.as_deref()),
            other => Err(unknown_key(other)),
        }
    }

    /// Checks the value before storing it.
    fn set(&mut self, key: &str, value: String) -> Result<()> {
        match key {
            API_URL_KEY => {
                if !(value.starts_with("http://") || value.starts_with("https://")) {
                    anyhow::bail!("api-url must start with http:// or https://");
                }
                self.api_url = Some(value.trim_end_matches('/').to_string());
                Ok(())
            }
            other => Err(unknown_key(other)),
        }
    }

    fn entries(&self) -> Vec<(&'static str, &str)> {
        self.api_url
            .as_deref()
            .map(|url| vec![(API_URL_KEY, url)])
            .unwrap_or_default()
    }
}

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow::anyhow!("Unknown configuration key '{}' (known keys: {})", key, API_URL_KEY)
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".speedline").join("config.toml"))
}

/// Missing file means defaults.
fn load_from(path: &Path) -> Result<CliConfig> {
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn save_to(path: &Path, cfg: &CliConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// `api-url` from the settings file, if one is stored and readable.
pub fn load_api_url() -> Option<String> {
    let path = config_path().ok()?;
    load_from(&path).ok()?.api_url
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    let path = config_path()?;

    match cmd {
        ConfigCommands::Set { key, value } => {
            let mut cfg = load_from(&path)?;
            cfg.set(&key, value)?;
            save_to(&path, &cfg)?;

            let stored = cfg.get(&key)?.unwrap_or_default();
            match format {
                OutputFormat::Table => output::print_success(&format!("{} = {}", key, stored)),
                _ => output::print_item(&serde_json::json!({ "key": key, "value": stored }), format)?,
            }
        }

        ConfigCommands::Get { key } => {
            let cfg = load_from(&path)?;
            let Some(value) = cfg.get(&key)? else {
                anyhow::bail!("Key '{}' is not set", key);
            };
            match format {
                OutputFormat::Table => println!("{}", value),
                _ => output::print_item(&serde_json::json!({ "key": key, "value": value }), format)?,
            }
        }

        ConfigCommands::Show => {
            let cfg = load_from(&path)?;
            let entries = cfg.entries();
            if entries.is_empty() {
                output::print_info(&format!("No settings stored in {}", path.display()));
                return Ok(());
            }

            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    for (key, value) in entries {
                        output::print_detail(key, value);
                    }
                }
                _ => output::print_item(&cfg, format)?,
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This deletes all CLI settings. Use --force to confirm.");
                return Ok(());
            }
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}
