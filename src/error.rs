//! Unified error handling for the backend controller
//!
//! Module errors ([`RuntimeError`], [`CheckpointError`], [`ConfigError`]) are
//! wrapped by a single [`Error`] alongside the control-plane failures callers
//! can act on: unknown backends, rejected scale-ups and invalid configs.
//!
//! # Usage
//!
//! ```rust,ignore
//! use backend_controller::error::{ClassifiedError, Error};
//!
//! fn on_tick_failure(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(error = %err, "Retrying tick");
//!     } else {
//!         panic!("restart required: {err}");
//!     }
//! }
//! ```

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::models::ModelError;
pub use crate::runtime::RuntimeError;
pub use crate::storage::CheckpointError;

use crate::models::BackendTag;

/// Common interface for classifying errors
pub trait ClassifiedError: std::error::Error {
    /// Whether the failed operation may be retried as-is
    fn is_recoverable(&self) -> bool;

    /// Error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Unknown backend
    NotFound,
    /// Admission check rejected a scale-up
    Capacity,
    /// Worker runtime failure
    Runtime,
    /// Checkpoint store or codec failure
    Storage,
    /// Invalid configuration
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Capacity => "capacity",
            Self::Runtime => "runtime",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    /// Backend is not registered
    #[error("Backend '{tag}' is not registered")]
    NotFound { tag: BackendTag },

    /// Admission check could not place every requested replica
    #[error(
        "Cannot scale backend '{tag}' to {target} replicas: tried to add {requested} \
         but resources only allow {schedulable}"
    )]
    CapacityExceeded {
        tag: BackendTag,
        target: u32,
        requested: usize,
        schedulable: usize,
    },

    /// Merged or supplied config is incomplete or invalid
    #[error("Invalid config field '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Worker runtime failure
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Checkpoint failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Configuration loading failure
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<ModelError> for Error {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidConfig { field, reason } => Self::InvalidConfig { field, reason },
            ModelError::InvalidTag { value, reason } => Self::InvalidConfig {
                field: format!("tag '{value}'"),
                reason,
            },
        }
    }
}

impl ClassifiedError for RuntimeError {
    fn is_recoverable(&self) -> bool {
        RuntimeError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Runtime
    }
}

impl ClassifiedError for CheckpointError {
    fn is_recoverable(&self) -> bool {
        CheckpointError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Storage
    }
}

impl ClassifiedError for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::NotFound { .. } => false,
            Self::CapacityExceeded { .. } => true, // capacity may free up
            Self::InvalidConfig { .. } => false,
            Self::Runtime(e) => ClassifiedError::is_recoverable(e),
            Self::Checkpoint(e) => ClassifiedError::is_recoverable(e),
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::CapacityExceeded { .. } => ErrorCategory::Capacity,
            Self::InvalidConfig { .. } | Self::Config(_) => ErrorCategory::Config,
            Self::Runtime(e) => e.category(),
            Self::Checkpoint(e) => e.category(),
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a not-found error
    pub fn not_found(tag: &BackendTag) -> Self {
        Self::NotFound { tag: tag.clone() }
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
