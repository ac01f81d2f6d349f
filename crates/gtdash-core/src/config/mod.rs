//! Configuration parsing and management.
//!
//! This module handles parsing of the dashboard configuration file (TOML)
//! that defines CLI binary locations, supervisor limits, the HTTP listener,
//! retention windows and workflow step commands.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::SupervisorConfig;

/// Top-level dashboard configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DashboardConfig {
    /// Process supervisor settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Retention of finished operations and workflows.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Workflow step commands.
    #[serde(default)]
    pub workflows: WorkflowsConfig,
}

impl DashboardConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let supervisor = &self.supervisor;
        if supervisor.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "supervisor.max_concurrent must be at least 1".to_string(),
            ));
        }
        if supervisor.default_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "supervisor.default_timeout must be greater than zero".to_string(),
            ));
        }
        if supervisor.breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "supervisor.breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if supervisor.gt_path.as_os_str().is_empty() || supervisor.bd_path.as_os_str().is_empty()
        {
            return Err(ConfigError::Validation(
                "supervisor.gt_path and supervisor.bd_path must not be empty".to_string(),
            ));
        }
        self.server.socket_addr()?;
        if self.retention.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "retention.sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind, e.g. `127.0.0.1:3030`.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl ServerConfig {
    /// Parse the bind address.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` when `bind` is not `host:port`.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind.parse().map_err(|e| {
            ConfigError::Validation(format!("server.bind '{}' is invalid: {e}", self.bind))
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3030".to_string()
}

/// Retention windows for the in-memory stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Age after which finished operations are dropped.
    #[serde(default = "default_max_age")]
    #[serde(with = "humantime_serde")]
    pub operation_max_age: Duration,

    /// Age after which workflows are dropped.
    #[serde(default = "default_max_age")]
    #[serde(with = "humantime_serde")]
    pub workflow_max_age: Duration,

    /// How often the daemon sweeps both stores.
    #[serde(default = "default_sweep_interval")]
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

const fn default_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            operation_max_age: default_max_age(),
            workflow_max_age: default_max_age(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Workflow step commands.
///
/// Maps a step name (e.g. `test`) to the `gt` arguments that perform it.
/// Steps without a command are skipped when a workflow runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct WorkflowsConfig {
    /// Step name to `gt` argv.
    #[serde(default)]
    pub steps: BTreeMap<String, Vec<String>>,
}

impl WorkflowsConfig {
    /// Arguments for a step, if configured.
    #[must_use]
    pub fn command_for(&self, step_name: &str) -> Option<&[String]> {
        self.steps.get(step_name).map(Vec::as_slice)
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serde adapter for human-readable durations (`"30s"`, `"5m"`, `"24h"`).
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
