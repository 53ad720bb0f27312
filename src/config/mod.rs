//! Configuration management for the backend controller
//!
//! Configuration is loaded from a TOML file or from `BACKENDCTL_*`
//! environment variables. The `[controller]` section maps directly onto
//! [`ControllerOptions`], which library users can also assemble with
//! [`ControllerOptions::builder`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::admission::{ClusterResources, NodeResources};
use crate::models::{BackendConfig, BackendTag, ReplicaConfig};
use crate::runtime::LifetimePolicy;

/// Key the controller stores its checkpoint under unless configured otherwise
pub const DEFAULT_CHECKPOINT_KEY: &str = "serve-backend-state-checkpoint";

/// Default control loop period
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Controller Options
// ============================================================================

/// Settings a `BackendController` is constructed with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerOptions {
    /// Controller name, prefixed to every worker name
    pub name: String,

    /// Key the checkpoint is stored under
    pub checkpoint_key: String,

    /// Period of the control loop in milliseconds
    pub tick_interval_ms: u64,

    /// Run admission checks before scaling up
    pub resource_check_enabled: bool,

    /// Workers outlive the controller
    pub detached: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            name: String::from("backend-controller"),
            checkpoint_key: String::from(DEFAULT_CHECKPOINT_KEY),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            resource_check_enabled: true,
            detached: false,
        }
    }
}

impl ControllerOptions {
    /// Create a new options builder
    pub fn builder() -> ControllerOptionsBuilder {
        ControllerOptionsBuilder::default()
    }

    /// Validate the options
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "controller.name".to_string(),
            });
        }
        if self.name.contains(':') {
            return Err(ConfigError::invalid(
                "controller.name",
                "must not contain ':' (used as the worker name separator)",
            ));
        }
        if self.checkpoint_key.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "controller.checkpoint_key".to_string(),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "controller.tick_interval_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Control loop period
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Lifetime policy for new workers
    pub fn lifetime(&self) -> LifetimePolicy {
        LifetimePolicy::from_detached(self.detached)
    }
}

/// Builder for [`ControllerOptions`]
#[derive(Debug, Default)]
pub struct ControllerOptionsBuilder {
    name: Option<String>,
    checkpoint_key: Option<String>,
    tick_interval_ms: Option<u64>,
    resource_check_enabled: Option<bool>,
    detached: Option<bool>,
}

impl ControllerOptionsBuilder {
    /// Set the controller name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the checkpoint key
    pub fn checkpoint_key(mut self, key: impl Into<String>) -> Self {
        self.checkpoint_key = Some(key.into());
        self
    }

    /// Set the control loop period
    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = Some(ms);
        self
    }

    /// Enable/disable admission checks
    pub fn resource_check_enabled(mut self, enabled: bool) -> Self {
        self.resource_check_enabled = Some(enabled);
        self
    }

    /// Enable/disable detached workers
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = Some(detached);
        self
    }

    /// Build the options
    pub fn build(self) -> Result<ControllerOptions, ConfigError> {
        let defaults = ControllerOptions::default();
        let options = ControllerOptions {
            name: self.name.unwrap_or(defaults.name),
            checkpoint_key: self.checkpoint_key.unwrap_or(defaults.checkpoint_key),
            tick_interval_ms: self.tick_interval_ms.unwrap_or(defaults.tick_interval_ms),
            resource_check_enabled: self
                .resource_check_enabled
                .unwrap_or(defaults.resource_check_enabled),
            detached: self.detached.unwrap_or(defaults.detached),
        };

        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// File Configuration
// ============================================================================

/// Where checkpoints are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    File,
}

/// Checkpoint store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,

    /// Directory for the file backend
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::Memory,
            dir: PathBuf::from("./checkpoints"),
        }
    }
}

/// Nodes used for admission checks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeResources>,
}

impl ClusterConfig {
    pub fn to_resources(&self) -> ClusterResources {
        ClusterResources::new(self.nodes.clone())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// A backend installed at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    pub tag: BackendTag,
    pub config: BackendConfig,
    pub replica: ReplicaConfig,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerOptions,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub backends: Vec<BackendSpec>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("BACKENDCTL_NAME") {
            config.controller.name = name;
        }
        if let Ok(key) = std::env::var("BACKENDCTL_CHECKPOINT_KEY") {
            config.controller.checkpoint_key = key;
        }
        if let Some(ms) = env_parse("BACKENDCTL_TICK_INTERVAL_MS") {
            config.controller.tick_interval_ms = ms;
        }
        if let Some(enabled) = env_parse("BACKENDCTL_RESOURCE_CHECK") {
            config.controller.resource_check_enabled = enabled;
        }
        if let Some(detached) = env_parse("BACKENDCTL_DETACHED") {
            config.controller.detached = detached;
        }

        if let Ok(backend) = std::env::var("BACKENDCTL_CHECKPOINT_BACKEND") {
            config.checkpoint.backend = match backend.to_lowercase().as_str() {
                "memory" => CheckpointBackend::Memory,
                "file" => CheckpointBackend::File,
                other => anyhow::bail!("Unknown checkpoint backend: {other}"),
            };
        }
        if let Ok(dir) = std::env::var("BACKENDCTL_CHECKPOINT_DIR") {
            config.checkpoint.dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("BACKENDCTL_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("BACKENDCTL_LOG_FORMAT") {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::invalid("logging.format", "must be 'text' or 'json'"));
        }

        if self.checkpoint.backend == CheckpointBackend::File
            && self.checkpoint.dir.as_os_str().is_empty()
        {
            return Err(ConfigError::MissingField {
                field: "checkpoint.dir".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(&backend.tag) {
                return Err(ConfigError::invalid(
                    "backends",
                    format!("duplicate backend tag '{}'", backend.tag),
                ));
            }
            backend
                .config
                .validate()
                .and_then(|()| backend.replica.validate())
                .map_err(|e| ConfigError::invalid(&format!("backends.{}", backend.tag), e.to_string()))?;
        }

        Ok(())
    }
}
