//! Application configuration.
//!
//! A YAML file plus command-line overrides. Everything has a default so a
//! bare `dockfleet` starts a working (if empty) control plane.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::RegistryEntry;

/// Default REST port.
pub const DEFAULT_PORT: u16 = 8761;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Can not read config {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Can not parse config {0}: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

/// Default data directory: `~/.dockfleet`.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dockfleet")
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_kv_prefix() -> String {
    "dockfleet".to_string()
}

fn default_reconcile_interval() -> u64 {
    60
}

/// Settings of the tag-update machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Tags ranked newest regardless of their shape, in order.
    #[serde(default = "default_latest_aliases")]
    pub latest_aliases: Vec<String>,

    /// Release-suffix order, earliest first (e.g. `["rc", "GA"]`).
    #[serde(default)]
    pub suffixes: Vec<String>,

    /// Strategy for jobs the reconciler emits.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Cluster the periodic reconciler watches; absent disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_cluster: Option<String>,

    #[serde(default = "default_tag_interval")]
    pub reconcile_interval_s: u64,
}

fn default_latest_aliases() -> Vec<String> {
    vec!["latest".to_string()]
}

fn default_strategy() -> String {
    "stopThenStartEach".to_string()
}

fn default_tag_interval() -> u64 {
    300
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            latest_aliases: default_latest_aliases(),
            suffixes: Vec::new(),
            strategy: default_strategy(),
            reconcile_cluster: None,
            reconcile_interval_s: default_tag_interval(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Root directory of the file-backed KV store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Prefix under which every record lives in the store.
    #[serde(default = "default_kv_prefix")]
    pub kv_prefix: String,

    /// Seconds between container reconciliation passes.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_s: u64,

    /// Image registries the reconciler may query.
    #[serde(default)]
    pub registries: Vec<RegistryEntry>,

    #[serde(default)]
    pub update: UpdateConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            data_dir: default_data_dir(),
            kv_prefix: default_kv_prefix(),
            reconcile_interval_s: default_reconcile_interval(),
            registries: Vec::new(),
            update: UpdateConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}
