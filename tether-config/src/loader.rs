use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tether_core::{Result, TetherError};

/// One `apps` entry exactly as written in the ecosystem file.
///
/// Every field is optional at this stage; the [`Validator`](crate::Validator)
/// decides what is required. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawApp {
    pub name: Option<String>,
    pub script: Option<String>,
    pub interpreter: Option<String>,
    pub interpreter_args: Option<ArgList>,
    pub args: Option<ArgList>,
    pub cwd: Option<String>,
    /// Values stay untyped so non-string entries can be reported as invalid.
    pub env: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(alias = "out_file")]
    pub output: Option<String>,
    #[serde(alias = "error_file", alias = "err_file")]
    pub error: Option<String>,
    pub autorestart: Option<bool>,
    pub max_restarts: Option<u32>,
    pub min_uptime: Option<u64>,
    pub restart_delay: Option<u64>,
    pub exp_backoff_restart_delay: Option<u64>,
    pub restart_window: Option<u64>,
    pub kill_timeout: Option<u64>,
    pub stop_exit_codes: Option<Vec<i32>>,
    pub truncate_logs: Option<bool>,
}

/// Arguments may be written as one whitespace-separated string or as a list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ArgList {
    Line(String),
    List(Vec<String>),
}

impl ArgList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ArgList::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            ArgList::List(list) => list,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EcosystemFile {
    #[serde(default)]
    apps: Vec<RawApp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from the file extension, JSON unless it says `.toml`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Parse the `apps` list out of an ecosystem document
pub fn parse_ecosystem(input: &str, format: ConfigFormat) -> Result<Vec<RawApp>> {
    let file: EcosystemFile = match format {
        ConfigFormat::Json => serde_json::from_str(input)
            .map_err(|e| TetherError::Validation(format!("Invalid JSON configuration: {}", e)))?,
        ConfigFormat::Toml => toml::from_str(input)
            .map_err(|e| TetherError::Validation(format!("Invalid TOML configuration: {}", e)))?,
    };

    if file.apps.is_empty() {
        return Err(TetherError::Validation(
            "Configuration declares no apps".to_string(),
        ));
    }

    Ok(file.apps)
}

/// Read and parse an ecosystem file from disk
pub fn load_file(path: &Path) -> Result<Vec<RawApp>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        TetherError::Validation(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let apps = parse_ecosystem(&content, ConfigFormat::from_path(path))?;
    tracing::debug!(path = %path.display(), apps = apps.len(), "Loaded ecosystem file");
    Ok(apps)
}
