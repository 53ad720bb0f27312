//! Core data structures for the backend controller
//!
//! Identities (`BackendTag`, `ReplicaTag`, `GoalId`) and the value objects a
//! backend is configured with. Configs are replaced wholesale on update; a
//! [`BackendConfigUpdate`] is merged onto the stored config and the result is
//! validated before it is installed.

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Separator between the backend tag and the random suffix of a replica tag
const REPLICA_TAG_SEPARATOR: char = '#';

/// Length of the random suffix appended to replica tags
const REPLICA_SUFFIX_LEN: usize = 6;

/// Default graceful shutdown timeout for replicas
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_MS: u64 = 20_000;

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$").expect("static tag pattern is valid")
    })
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while constructing or merging model values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Tag contains characters outside the allowed set
    #[error("Invalid tag '{value}': {reason}")]
    InvalidTag { value: String, reason: String },

    /// Config field failed validation
    #[error("Invalid value for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },
}

impl ModelError {
    /// Create an invalid config error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Identities
// ============================================================================

/// Unique identity of a logical backend (deployment)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendTag(String);

impl BackendTag {
    /// Create a backend tag, validating its character set
    pub fn new(value: impl Into<String>) -> Result<Self, ModelError> {
        let value = value.into();
        if !tag_pattern().is_match(&value) {
            return Err(ModelError::InvalidTag {
                value,
                reason: "must start with an alphanumeric character and contain only \
                         alphanumerics, '.', '_', ':' or '-' (max 128)"
                    .to_string(),
            });
        }
        Ok(Self(value))
    }

    /// Get the tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BackendTag {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for BackendTag {
    type Error = ModelError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BackendTag> for String {
    fn from(tag: BackendTag) -> Self {
        tag.0
    }
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identity of one replica: backend tag plus a random suffix
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaTag(String);

impl ReplicaTag {
    /// Generate a fresh replica tag for a backend
    pub fn generate(backend: &BackendTag) -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..REPLICA_SUFFIX_LEN)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        Self(format!("{backend}{REPLICA_TAG_SEPARATOR}{suffix}"))
    }

    /// The backend portion of the tag
    pub fn backend_part(&self) -> &str {
        self.0
            .split_once(REPLICA_TAG_SEPARATOR)
            .map_or(self.0.as_str(), |(backend, _)| backend)
    }

    /// Get the tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an awaitable goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalId(Uuid);

impl GoalId {
    /// Allocate a new random goal id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for GoalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Resource Requirements
// ============================================================================

/// Per-replica resource requirements checked at admission time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU cores
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// GPU devices
    #[serde(default)]
    pub gpus: f64,

    /// Memory in megabytes
    #[serde(default)]
    pub memory_mb: u64,

    /// Custom named resources
    #[serde(default)]
    pub custom: BTreeMap<String, f64>,
}

fn default_cpus() -> f64 {
    1.0
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            gpus: 0.0,
            memory_mb: 0,
            custom: BTreeMap::new(),
        }
    }
}

impl ResourceRequirements {
    /// Requirements with only a CPU demand
    pub fn cpus(cpus: f64) -> Self {
        Self {
            cpus,
            ..Self::default()
        }
    }

    /// Add a custom resource demand
    pub fn with_custom(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.custom.insert(name.into(), amount);
        self
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.cpus < 0.0 || self.gpus < 0.0 {
            return Err(ModelError::invalid_config(
                "resources",
                "cpus and gpus must not be negative",
            ));
        }
        if let Some((name, _)) = self.custom.iter().find(|(_, amount)| **amount < 0.0) {
            return Err(ModelError::invalid_config(
                format!("resources.custom.{name}"),
                "must not be negative",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Replica Config
// ============================================================================

/// How replicas of a backend are created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Worker entrypoint handed to the runtime
    pub entrypoint: String,

    /// Arguments passed to the worker on construction
    #[serde(default)]
    pub init_args: Vec<serde_json::Value>,

    /// Resources each replica needs
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl ReplicaConfig {
    /// Create a replica config for an entrypoint with default resources
    pub fn new(entrypoint: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            init_args: Vec::new(),
            resources: ResourceRequirements::default(),
        }
    }

    /// Set the resource requirements
    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    /// Set the init arguments
    pub fn with_init_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.init_args = args;
        self
    }

    /// Validate the replica config
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.entrypoint.trim().is_empty() {
            return Err(ModelError::invalid_config("entrypoint", "must not be empty"));
        }
        self.resources.validate()
    }
}

// ============================================================================
// Backend Config
// ============================================================================

/// Desired shape of a backend. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Desired replica count
    pub num_replicas: u32,

    /// Maximum in-flight queries per replica
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: u32,

    /// Maximum batch size, if batching is enabled
    #[serde(default)]
    pub max_batch_size: Option<u32>,

    /// Time to wait for a batch to fill, in milliseconds
    #[serde(default)]
    pub batch_wait_timeout_ms: u64,

    /// Time a replica is given to drain before it is force-terminated
    #[serde(default = "default_graceful_shutdown_timeout_ms")]
    pub graceful_shutdown_timeout_ms: u64,

    /// Opaque user configuration pushed to replicas
    #[serde(default)]
    pub user_config: Option<serde_json::Value>,
}

fn default_max_concurrent_queries() -> u32 {
    100
}

fn default_graceful_shutdown_timeout_ms() -> u64 {
    DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_MS
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            num_replicas: 1,
            max_concurrent_queries: default_max_concurrent_queries(),
            max_batch_size: None,
            batch_wait_timeout_ms: 0,
            graceful_shutdown_timeout_ms: default_graceful_shutdown_timeout_ms(),
            user_config: None,
        }
    }
}

impl BackendConfig {
    /// Config with the given replica count and defaults elsewhere
    pub fn with_replicas(num_replicas: u32) -> Self {
        Self {
            num_replicas,
            ..Self::default()
        }
    }

    /// Graceful shutdown timeout as a `Duration`
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    /// Check that every field holds a usable value
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.max_concurrent_queries == 0 {
            return Err(ModelError::invalid_config(
                "max_concurrent_queries",
                "must be greater than 0",
            ));
        }
        if self.max_batch_size == Some(0) {
            return Err(ModelError::invalid_config(
                "max_batch_size",
                "must be greater than 0 when set",
            ));
        }
        if self.max_batch_size.is_none() && self.batch_wait_timeout_ms > 0 {
            return Err(ModelError::invalid_config(
                "batch_wait_timeout_ms",
                "requires max_batch_size",
            ));
        }
        Ok(())
    }

    /// Whether anything other than the replica count differs
    ///
    /// Downstream consumers only care about these fields, so a pure scale
    /// change does not need a config broadcast.
    pub fn differs_beyond_replicas(&self, other: &Self) -> bool {
        let mut normalized = other.clone();
        normalized.num_replicas = self.num_replicas;
        *self != normalized
    }
}

/// Partial update merged onto a stored [`BackendConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_replicas: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_queries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<Option<u32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_wait_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_config: Option<Option<serde_json::Value>>,
}

impl BackendConfigUpdate {
    /// Update that only changes the replica count
    pub fn replicas(num_replicas: u32) -> Self {
        Self {
            num_replicas: Some(num_replicas),
            ..Self::default()
        }
    }

    /// Merge onto `base` and validate the result
    pub fn apply(&self, base: &BackendConfig) -> Result<BackendConfig, ModelError> {
        let mut merged = base.clone();
        if let Some(n) = self.num_replicas {
            merged.num_replicas = n;
        }
        if let Some(n) = self.max_concurrent_queries {
            merged.max_concurrent_queries = n;
        }
        if let Some(size) = self.max_batch_size {
            merged.max_batch_size = size;
        }
        if let Some(ms) = self.batch_wait_timeout_ms {
            merged.batch_wait_timeout_ms = ms;
        }
        if let Some(ms) = self.graceful_shutdown_timeout_ms {
            merged.graceful_shutdown_timeout_ms = ms;
        }
        if let Some(user_config) = &self.user_config {
            merged.user_config = user_config.clone();
        }
        merged.validate()?;
        Ok(merged)
    }

    /// Whether the update sets no field at all
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ============================================================================
// Backend Info
// ============================================================================

/// Installed metadata for a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub backend_config: BackendConfig,
    pub replica_config: ReplicaConfig,
}

impl BackendInfo {
    /// Create backend info
    pub fn new(backend_config: BackendConfig, replica_config: ReplicaConfig) -> Self {
        Self {
            backend_config,
            replica_config,
        }
    }

    /// Whether this info was installed from exactly these configs
    pub fn matches(&self, backend_config: &BackendConfig, replica_config: &ReplicaConfig) -> bool {
        self.backend_config == *backend_config && self.replica_config == *replica_config
    }
}
