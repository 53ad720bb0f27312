//! Worker-process runtime interface
//!
//! The controller never talks to processes directly. Everything it needs from
//! the outside world (lookup by stable name, asynchronous creation, readiness,
//! drain and forced termination) goes through [`WorkerRuntime`]. Long-running
//! operations hand back a [`Completion`] which is polled without blocking from
//! the reconciliation tick.

pub mod local;

pub use local::{LocalRuntime, LocalRuntimeConfig};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::models::{ReplicaConfig, ResourceRequirements};

// ============================================================================
// Errors
// ============================================================================

/// Unexpected failures reported by a worker runtime
///
/// A worker that simply does not exist is never an error; runtimes report
/// that as `Ok(None)` from [`WorkerRuntime::lookup`] and tolerate it in
/// drain and terminate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Failed to look up worker '{name}': {reason}")]
    Lookup { name: String, reason: String },

    #[error("Failed to create worker '{name}': {reason}")]
    Create { name: String, reason: String },

    #[error("Worker '{name}' failed during startup: {reason}")]
    Startup { name: String, reason: String },

    #[error("Failed to drain worker '{name}': {reason}")]
    Drain { name: String, reason: String },

    #[error("Failed to terminate worker '{name}': {reason}")]
    Terminate { name: String, reason: String },

    #[error("Worker runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    /// Whether retrying the same call on a later tick can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Lookup { .. } | Self::Unavailable(_))
    }
}

// ============================================================================
// Worker Identity
// ============================================================================

/// Callable handle to a live worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle {
    /// Stable name the worker was registered under
    pub name: String,

    /// Runtime-assigned instance id
    pub worker_id: String,
}

impl WorkerHandle {
    /// Create a worker handle
    pub fn new(name: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_id: worker_id.into(),
        }
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.worker_id)
    }
}

/// Whether a worker outlives the controller that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifetimePolicy {
    /// Worker keeps running if the controller exits
    Detached,

    /// Worker is torn down with its owner
    #[default]
    Owned,
}

impl LifetimePolicy {
    /// Policy for a `detached` flag
    pub fn from_detached(detached: bool) -> Self {
        if detached {
            Self::Detached
        } else {
            Self::Owned
        }
    }
}

/// Everything needed to create a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub entrypoint: String,
    pub resources: ResourceRequirements,
    pub lifetime: LifetimePolicy,
    pub init_args: Vec<serde_json::Value>,
}

impl WorkerSpec {
    /// Build a spec for a named worker from a replica config
    pub fn from_replica_config(
        name: impl Into<String>,
        config: &ReplicaConfig,
        lifetime: LifetimePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            entrypoint: config.entrypoint.clone(),
            resources: config.resources.clone(),
            lifetime,
            init_args: config.init_args.clone(),
        }
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Outcome of polling a [`Completion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Pending,
    Done,
    Failed(String),
}

/// Result of a background operation, polled with zero timeout
#[derive(Debug)]
pub struct Completion {
    state: CompletionState,
}

#[derive(Debug)]
enum CompletionState {
    Waiting(oneshot::Receiver<Result<(), String>>),
    Resolved(CompletionStatus),
}

impl Completion {
    /// Create a linked sender and completion
    pub fn channel() -> (CompletionSender, Completion) {
        let (tx, rx) = oneshot::channel();
        (
            CompletionSender { tx },
            Completion {
                state: CompletionState::Waiting(rx),
            },
        )
    }

    /// A completion that is already done
    pub fn done() -> Self {
        Self {
            state: CompletionState::Resolved(CompletionStatus::Done),
        }
    }

    /// A completion that has already failed
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: CompletionState::Resolved(CompletionStatus::Failed(reason.into())),
        }
    }

    /// Poll without blocking. Once resolved the outcome is sticky.
    pub fn poll(&mut self) -> CompletionStatus {
        let status = match &mut self.state {
            CompletionState::Resolved(status) => return status.clone(),
            CompletionState::Waiting(rx) => match rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => return CompletionStatus::Pending,
                Err(oneshot::error::TryRecvError::Closed) => {
                    CompletionStatus::Failed("operation abandoned by runtime".to_string())
                }
                Ok(Ok(())) => CompletionStatus::Done,
                Ok(Err(reason)) => CompletionStatus::Failed(reason),
            },
        };
        self.state = CompletionState::Resolved(status.clone());
        status
    }
}

/// Resolves the paired [`Completion`]
#[derive(Debug)]
pub struct CompletionSender {
    tx: oneshot::Sender<Result<(), String>>,
}

impl CompletionSender {
    /// Mark the operation as done
    pub fn complete(self) {
        let _ = self.tx.send(Ok(()));
    }

    /// Mark the operation as failed
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(reason.into()));
    }
}

// ============================================================================
// Runtime Trait
// ============================================================================

/// Primitives the controller consumes from the worker-process runtime
///
/// Implementations must be safe to call from the controller's single thread
/// of control while their own background work proceeds concurrently.
pub trait WorkerRuntime: Send + Sync {
    /// Find a worker by stable name
    fn lookup(&self, name: &str) -> Result<Option<WorkerHandle>, RuntimeError>;

    /// Start creating a worker. The completion fires once it is ready.
    fn create(&self, spec: WorkerSpec) -> Result<(WorkerHandle, Completion), RuntimeError>;

    /// Readiness of an existing worker
    fn ready(&self, handle: &WorkerHandle) -> Result<Completion, RuntimeError>;

    /// Ask a worker to finish in-flight work. Absent workers complete at once.
    fn drain(&self, handle: &WorkerHandle) -> Result<Completion, RuntimeError>;

    /// Kill a worker immediately. Absent workers are ignored.
    fn terminate(&self, handle: &WorkerHandle) -> Result<(), RuntimeError>;
}
