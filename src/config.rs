use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use crate::error::AppError;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Free-form application settings, reachable through the typed getters.
    #[serde(default)]
    pub app: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path.as_ref()).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_yaml::from_str(&contents)?)
    }

    // ------------------------------------------------------------------------
    // Typed application settings
    // ------------------------------------------------------------------------

    /// Look up a string setting from the `app` table.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.app.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    /// Look up an integer setting from the `app` table.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.app
            .get(key)
            .and_then(|v| v.as_i64())
            .unwrap_or(default)
    }

    /// Look up a boolean setting from the `app` table.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.app
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Look up a string setting that the application cannot run without.
    ///
    /// Absence is fatal to the current request, not to the process.
    pub fn require_string(&self, key: &str) -> Result<String, AppError> {
        match self.app.get(key).and_then(|v| v.as_str()) {
            Some(s) => Ok(s.to_string()),
            None => Err(AppError::MissingConfig(key.to_string())),
        }
    }
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    300
}

fn default_reap_min() -> i64 {
    600
}

fn default_reap_max() -> i64 {
    3600
}

fn default_reap_increment() -> i64 {
    600
}

fn default_sweep_interval() -> u64 {
    10
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

// ============================================================================
// SessionConfig
// ============================================================================

/// Session reaping parameters, all in seconds.
///
/// A session becomes eligible for eviction after
/// `min(reap_min + (hits - 1) * reap_increment, reap_max)` seconds of
/// inactivity, so busier sessions live longer.
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_reap_min")]
    pub reap_min_seconds: i64,
    #[serde(default = "default_reap_max")]
    pub reap_max_seconds: i64,
    #[serde(default = "default_reap_increment")]
    pub reap_increment_seconds: i64,
    /// Minimum interval between reaper sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reap_min_seconds: default_reap_min(),
            reap_max_seconds: default_reap_max(),
            reap_increment_seconds: default_reap_increment(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

// ============================================================================
// DatabaseConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection descriptor handed to the database connector.
    pub conninfo: String,
}

// ============================================================================
// Tests
// ============================================================================
