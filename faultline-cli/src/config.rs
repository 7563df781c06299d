//! Configuration loading for the `faultline` binary.
//!
//! Configuration is loaded from a TOML file (default: `faultline.toml`).
//!
//! ```toml
//! log_filter = "info,faultline_core=debug"
//!
//! [[routes]]
//! listen = "127.0.0.1:27016"
//! destination = "127.0.0.1:27017"
//! min_delay_ms = 5
//! max_delay_ms = 50
//!
//! [chaos]
//! containers = ["mongo-1", "mongo-2", "mongo-3"]
//! max_concurrent_pauses = 1
//! occurrences = 10
//! pause_min_ms = 500
//! pause_max_ms = 2000
//!
//! [run]
//! timeout_secs = 120
//! ```

use faultline_core::{ChaosSpec, ProxyRoute};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Default tracing filter when `RUST_LOG` is unset (default: `info`).
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Proxy routes.
    #[serde(default)]
    pub routes: Vec<ProxyRoute>,
    /// Replica chaos.
    #[serde(default)]
    pub chaos: Option<ChaosConfig>,
    /// Run limits.
    #[serde(default)]
    pub run: RunConfig,
}

/// Chaos against containers that already exist.
#[derive(Debug, Clone, Deserialize)]
pub struct ChaosConfig {
    /// Container names or ids forming the replica group.
    pub containers: Vec<String>,
    /// Pause schedule.
    #[serde(flatten)]
    pub spec: ChaosSpec,
}

/// Run limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Monitor timeout in seconds (default: 300).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
