//! CLI configuration file and argument parsing helpers.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use shelfsync_common::FieldMap;
use shelfsync_remote::HttpRemoteConfig;
use shelfsync_sync::SyncConfig;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "shelfsync.json";

/// Durable backend for the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Json,
}

impl BackendKind {
    /// File name of the store inside the data directory.
    pub fn file_name(self) -> &'static str {
        match self {
            BackendKind::Sqlite => "store.db",
            BackendKind::Json => "store.json",
        }
    }
}

/// Contents of `shelfsync.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub backend: BackendKind,
    pub remote: HttpRemoteConfig,
    pub sync: SyncConfig,
}

impl CliConfig {
    /// Load the configuration from `data_dir`, falling back to defaults when
    /// the file does not exist.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }
}

/// Default data directory: the platform data dir, else the working directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("shelfsync"))
        .unwrap_or_else(|| PathBuf::from(".shelfsync"))
}

/// Parse a value as JSON, falling back to a plain string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Parse `name=value` assignments into a field map.
pub fn parse_fields(assignments: &[String]) -> Result<FieldMap> {
    assignments
        .iter()
        .map(|assignment| {
            let (name, value) = assignment
                .split_once('=')
                .with_context(|| format!("Expected name=value, got '{}'", assignment))?;
            let name = name.trim();
            anyhow::ensure!(!name.is_empty(), "Empty field name in '{}'", assignment);
            Ok((name.to_string(), parse_value(value)))
        })
        .collect()
}
