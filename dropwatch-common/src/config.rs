//! Configuration loading and project routing
//!
//! All monitors construct one `Config` at startup and pass it by reference;
//! there is no module-level mutable configuration. The TOML file location is
//! resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. `DROPWATCH_CONFIG` environment variable
//! 3. Platform config directory (`<config dir>/dropwatch/config.toml`)
//!
//! Secrets (Postgres URL, Sheets token) may be supplied via environment
//! variables, which override the file.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "DROPWATCH_CONFIG";
pub const POSTGRES_URL_ENV_VAR: &str = "DROPWATCH_DATABASE_URL";
pub const SHEETS_TOKEN_ENV_VAR: &str = "DROPWATCH_SHEETS_TOKEN";

/// One WhatsApp group / project routing entry.
///
/// `enabled` gates every monitor: disabled projects are neither scanned nor
/// messaged. `sheet_tab` is absent for projects that do not mirror to the
/// spreadsheet.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub group_jid: String,
    pub group_name: String,
    #[serde(default)]
    pub sheet_tab: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Google Sheets mirror settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    /// OAuth bearer token; overridable via `DROPWATCH_SHEETS_TOKEN`.
    #[serde(default)]
    pub api_token: String,
    /// Values API endpoint, overridable for tests.
    #[serde(default = "default_sheets_base_url")]
    pub base_url: String,
}

fn default_sheets_base_url() -> String {
    "https://sheets.googleapis.com/v4/spreadsheets".to_string()
}

/// Top-level configuration shared by all monitors.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the bridge's SQLite message mirror.
    pub messages_db: PathBuf,
    /// Base URL of the WhatsApp bridge REST API.
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// Postgres connection URL; overridable via `DROPWATCH_DATABASE_URL`.
    #[serde(default)]
    pub postgres_url: String,
    /// Directory for state and health files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub sheets: Option<SheetsConfig>,
    /// Command the kill monitor runs to stop all managed services.
    #[serde(default)]
    pub shutdown_command: Vec<String>,
    pub projects: Vec<ProjectConfig>,
}

fn default_bridge_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Config {
    /// Load and validate configuration, applying environment overrides.
    /// Any validation failure here is configuration-class and fatal.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(cli_path)?;
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("Invalid config file {}: {}", path.display(), e)))?;

        if let Ok(url) = std::env::var(POSTGRES_URL_ENV_VAR) {
            config.postgres_url = url;
        }
        if let Ok(token) = std::env::var(SHEETS_TOKEN_ENV_VAR) {
            if let Some(sheets) = config.sheets.as_mut() {
                sheets.api_token = token;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.postgres_url.is_empty() {
            return Err(Error::Config(format!(
                "postgres_url not set (config file or {})",
                POSTGRES_URL_ENV_VAR
            )));
        }
        if self.projects.is_empty() {
            return Err(Error::Config("no projects configured".to_string()));
        }
        if let Some(sheets) = &self.sheets {
            if sheets.api_token.is_empty() {
                return Err(Error::Config(format!(
                    "sheets.api_token not set (config file or {})",
                    SHEETS_TOKEN_ENV_VAR
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_projects(&self) -> impl Iterator<Item = &ProjectConfig> {
        self.projects.iter().filter(|p| p.enabled)
    }

    /// Routing lookup by project name. There is deliberately no default
    /// destination: an unknown project is a hard error so feedback can never
    /// leak into the wrong group.
    pub fn project(&self, name: &str) -> Result<&ProjectConfig> {
        self.projects
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::UnknownProject(name.to_string()))
    }

}

fn resolve_config_path(cli_path: Option<&Path>) -> Result<PathBuf> {
    // Priority 1: command-line argument
    if let Some(path) = cli_path {
        return Ok(path.to_path_buf());
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }

    // Priority 3: platform config directory
    let default = dirs::config_dir()
        .map(|d| d.join("dropwatch").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    if default.exists() {
        Ok(default)
    } else {
        Err(Error::Config(format!(
            "No config file found (tried {}); pass --config or set {}",
            default.display(),
            CONFIG_ENV_VAR
        )))
    }
}
