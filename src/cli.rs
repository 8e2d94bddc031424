// src/cli.rs

use crate::{config, key_manager::KeyStatus, resolve_config_path, AppState, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "gemini-key-pool",
    version,
    about = "Gemini API key pool with quota-aware rotation and a retrying generation client",
    long_about = "Spreads Gemini generateContent calls over a pool of API keys, enforcing per-key daily quotas, disabling failing keys for a time window, and retrying transient upstream failures with exponential backoff."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the HTTP service (default)
    Serve,

    /// Inspect or reset the key pool counters
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },

    /// Configuration utilities
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeyCommands {
    /// Print the status of every configured key
    Status,
    /// Delete every usage and failure counter
    Reset {
        /// Required to actually delete counters
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Load and validate the configuration, then exit
    Validate,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    keys: Vec<KeyStatus>,
    total_available_capacity: u64,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}

/// `keys status`: pretty JSON on stdout.
pub async fn keys_status(config_path: Option<PathBuf>) -> Result<String> {
    let app_config = crate::setup_configuration(config_path)?;
    let state = AppState::new(&app_config).await?;
    let keys = state.key_manager.all_statuses().await?;
    let total_available_capacity: u64 = keys
        .iter()
        .filter(|k| k.available)
        .map(KeyStatus::remaining_today)
        .sum();
    let report = StatusReport {
        keys,
        total_available_capacity,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

/// `keys reset`: number of counters removed.
pub async fn keys_reset(config_path: Option<PathBuf>) -> Result<u64> {
    let app_config = crate::setup_configuration(config_path)?;
    let state = AppState::new(&app_config).await?;
    state.key_manager.reset_all().await
}

/// `config validate`: loads the file with environment overrides applied.
pub fn config_validate(config_path: Option<PathBuf>) -> Result<String> {
    let path = resolve_config_path(config_path);
    let app_config = config::load_config(&path)?;
    Ok(format!(
        "Configuration at {} is valid: {} key(s), default model {}",
        path.display(),
        app_config.keys.api_keys.len(),
        app_config.generation.default_model
    ))
}
