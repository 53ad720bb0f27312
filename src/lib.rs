//! backend-controller - replica orchestration with checkpointed recovery
//!
//! Keeps the replicas of every registered backend at their configured count.
//! Control-plane calls record intent and return an awaitable goal; a periodic
//! reconciliation tick drives replicas through their lifecycle against a
//! pluggable worker runtime.
//!
//! # Architecture
//!
//! - [`controller`] - the reconciling [`BackendController`](controller::BackendController) and its async driver
//! - [`replica`] - per-replica lifecycle state machine
//! - [`goal`] - awaitable goal tracking
//! - [`runtime`] - worker runtime trait and the in-process runtime
//! - [`admission`] - resource feasibility checks for scale-ups
//! - [`storage`] - key-value stores and the checkpoint codec
//! - [`notifications`] - long-poll snapshots of configs and replica handles
//! - [`config`] - controller options and file/env configuration
//! - [`metrics`] - Prometheus metrics
//! - [`models`] - tags, configs and goal ids
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use backend_controller::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let controller = BackendController::new(
//!         ControllerOptions::default(),
//!         Arc::new(LocalRuntime::new(LocalRuntimeConfig::automatic())),
//!         Arc::new(Unbounded),
//!         Arc::new(MemoryKvStore::new()),
//!         Arc::new(LongPollHost::new()),
//!     )?;
//!     let handle = ControllerHandle::new(controller);
//!
//!     let tag = BackendTag::new("svc-a")?;
//!     let _goal = handle
//!         .create_backend(&tag, BackendConfig::with_replicas(2), ReplicaConfig::new("app:Model"))
//!         .await?;
//!     while handle.update().await? {}
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod config;
pub mod controller;
pub mod error;
pub mod goal;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod replica;
pub mod runtime;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admission::{ClusterResources, NodeResources, ResourceScheduler, Unbounded};
    pub use crate::config::{Config, ControllerOptions};
    pub use crate::controller::{BackendController, ControllerHandle, ControllerSnapshot};
    pub use crate::error::{ClassifiedError, Error, ErrorCategory, Result};
    pub use crate::goal::{GoalTracker, GoalWaiter};
    pub use crate::models::{
        BackendConfig, BackendConfigUpdate, BackendInfo, BackendTag, GoalId, ReplicaConfig,
        ResourceRequirements,
    };
    pub use crate::notifications::{LongPollHost, NotificationHost, Topic, Update};
    pub use crate::replica::{ReplicaInstance, ReplicaState};
    pub use crate::runtime::{LocalRuntime, LocalRuntimeConfig, WorkerHandle, WorkerRuntime};
    pub use crate::storage::{FileKvStore, KvStore, MemoryKvStore};
}

// Direct re-exports for convenience
pub use controller::{BackendController, ControllerHandle};
pub use models::{BackendConfig, BackendTag, GoalId, ReplicaConfig};
