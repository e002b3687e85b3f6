//! Runtime configuration, loaded from `~/.telos/config.toml`.
//!
//! Missing file means defaults get written out on first run. Paths under
//! the telos directory are computed, never serialized.

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory under which the `.telos` data dir lives - computed, not
    /// serialized.
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed, not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between heartbeat cycles.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Run the invariants audit every N cycles.
    #[serde(default = "default_audit_every")]
    pub audit_every_cycles: u64,
    /// Max atomic goals executed per cycle.
    #[serde(default = "default_execute_batch")]
    pub execute_batch: usize,
    /// Max composites decomposed per cycle.
    #[serde(default = "default_decompose_batch")]
    pub decompose_batch: usize,
}

fn default_heartbeat_secs() -> u64 {
    30
}
fn default_audit_every() -> u64 {
    10
}
fn default_execute_batch() -> usize {
    3
}
fn default_decompose_batch() -> usize {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            audit_every_cycles: default_audit_every(),
            execute_batch: default_execute_batch(),
            decompose_batch: default_decompose_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Seconds before an oracle call is abandoned.
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
}

fn default_oracle_timeout() -> u64 {
    60
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_oracle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SafetyConfig {
    /// Override rows written on startup, keyed by constraint type name.
    /// Constraints already present in the store win over these.
    #[serde(default)]
    pub limits: std::collections::HashMap<String, f64>,
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        Self {
            workspace_dir: home.clone(),
            config_path: home.join(".telos").join("config.toml"),
            scheduler: SchedulerConfig::default(),
            oracle: OracleConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let telos_dir = home.join(".telos");
        let config_path = telos_dir.join("config.toml");

        if !telos_dir.exists() {
            fs::create_dir_all(&telos_dir).context("Failed to create .telos directory")?;
        }

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.workspace_dir = home;
            Ok(config)
        } else {
            let mut config = Config::default();
            config.config_path = config_path;
            config.workspace_dir = home;
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        let parent = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent)?;
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }
}
