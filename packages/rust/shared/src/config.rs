//! Application configuration for assetcat.
//!
//! User config lives at `~/.assetcat/assetcat.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::types::{ActorKind, ActorSpec};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "assetcat.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".assetcat";

// ---------------------------------------------------------------------------
// Config structs (matching assetcat.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Worker process isolation settings.
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// Configured actors (sources, processors, analyzers, editors).
    #[serde(default)]
    pub actors: Vec<ActorConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Catalog database location.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// In-flight asset pipelines per changeset.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// How long shutdown waits for a canceled changeset to acknowledge.
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            concurrency: default_concurrency(),
            cancel_timeout_secs: default_cancel_timeout(),
        }
    }
}

fn default_database_path() -> String {
    "~/.assetcat/catalog.db".into()
}
fn default_concurrency() -> u32 {
    4
}
fn default_cancel_timeout() -> u64 {
    10
}

/// `[isolation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Maximum concurrent worker processes.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Per-execution timeout for a processing unit, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Worker executable. Defaults to the running binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_cmd: Option<String>,

    /// Arguments passed to the worker executable.
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_secs: default_timeout(),
            worker_cmd: None,
            worker_args: default_worker_args(),
        }
    }
}

fn default_workers() -> u32 {
    2
}
fn default_timeout() -> u64 {
    60
}
fn default_worker_args() -> Vec<String> {
    vec!["worker".into()]
}

/// `[[actors]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Unique actor name; the stable id is assigned on first registration.
    pub name: String,
    /// `source`, `processor`, `analyzer` or `editor`.
    pub kind: String,
    /// Plugin registry identifier.
    pub plugin: String,
    /// Plugin-specific settings.
    #[serde(default)]
    pub config: toml::Table,
}

impl ActorConfig {
    /// Convert to a store-ready actor definition.
    pub fn to_spec(&self) -> Result<ActorSpec> {
        let config = serde_json::to_value(&self.config).map_err(|e| {
            CatalogError::config(format!("actor `{}` has unusable config: {e}", self.name))
        })?;
        Ok(ActorSpec {
            name: self.name.clone(),
            kind: ActorKind::parse(&self.kind)?,
            plugin: self.plugin.clone(),
            config,
        })
    }
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime changeset configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// In-flight asset pipelines per changeset.
    pub concurrency: usize,
    /// Maximum concurrent worker processes.
    pub workers: usize,
    /// Per-execution unit timeout.
    pub unit_timeout: Duration,
    /// Bounded wait for cancellation acknowledgment.
    pub cancel_timeout: Duration,
    /// Worker executable; `None` means the running binary.
    pub worker_cmd: Option<String>,
    /// Worker arguments.
    pub worker_args: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.defaults.concurrency.max(1) as usize,
            workers: config.isolation.workers.max(1) as usize,
            unit_timeout: Duration::from_secs(config.isolation.timeout_secs),
            cancel_timeout: Duration::from_secs(config.defaults.cancel_timeout_secs),
            worker_cmd: config.isolation.worker_cmd.clone(),
            worker_args: config.isolation.worker_args.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.assetcat/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CatalogError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.assetcat/assetcat.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| CatalogError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalogError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| CatalogError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_actors(&config)?;
    Ok(config)
}

/// Reject duplicate actor names and unknown kinds before anything runs.
fn validate_actors(config: &AppConfig) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for actor in &config.actors {
        if !seen.insert(actor.name.as_str()) {
            return Err(CatalogError::config(format!(
                "actor `{}` is configured twice",
                actor.name
            )));
        }
        ActorKind::parse(&actor.kind)?;
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CatalogError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CatalogError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CatalogError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
