//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use backend_controller::admission::{ResourceScheduler, Unbounded};
use backend_controller::config::ControllerOptions;
use backend_controller::controller::BackendController;
use backend_controller::models::{BackendConfig, BackendTag, ReplicaConfig};
use backend_controller::notifications::LongPollHost;
use backend_controller::replica::ReplicaState;
use backend_controller::runtime::LocalRuntime;
use backend_controller::storage::MemoryKvStore;

pub const CONTROLLER_NAME: &str = "test-controller";

/// Controller wired to a manual runtime and shared in-memory store
pub struct Harness {
    pub controller: BackendController,
    pub runtime: LocalRuntime,
    pub store: MemoryKvStore,
    pub host: Arc<LongPollHost>,
}

impl Harness {
    /// Fresh harness with unbounded admission
    pub fn new() -> Self {
        Self::with_scheduler(Arc::new(Unbounded))
    }

    pub fn with_scheduler(scheduler: Arc<dyn ResourceScheduler>) -> Self {
        let runtime = LocalRuntime::manual();
        let store = MemoryKvStore::new();
        let host = Arc::new(LongPollHost::new());
        let controller = build(runtime.clone(), store.clone(), scheduler, host.clone());
        Self {
            controller,
            runtime,
            store,
            host,
        }
    }

    /// Drop the controller and build a new one from the same store and
    /// runtime, as after a crash
    pub fn restart(self) -> Self {
        let Self {
            controller,
            runtime,
            store,
            host,
        } = self;
        drop(controller);
        let controller = build(runtime.clone(), store.clone(), Arc::new(Unbounded), host.clone());
        Self {
            controller,
            runtime,
            store,
            host,
        }
    }

    /// Tick, mark every worker ready, tick again
    pub fn settle(&mut self) {
        self.controller.update().unwrap();
        self.runtime.mark_all_ready();
        self.controller.update().unwrap();
    }

    pub fn count(&self, tag: &BackendTag, state: ReplicaState) -> usize {
        self.controller.replica_count(tag, state)
    }
}

fn build(
    runtime: LocalRuntime,
    store: MemoryKvStore,
    scheduler: Arc<dyn ResourceScheduler>,
    host: Arc<LongPollHost>,
) -> BackendController {
    BackendController::new(options(), Arc::new(runtime), scheduler, Arc::new(store), host)
        .unwrap()
}

pub fn options() -> ControllerOptions {
    ControllerOptions::builder()
        .name(CONTROLLER_NAME)
        .build()
        .unwrap()
}

pub fn tag(name: &str) -> BackendTag {
    BackendTag::new(name).unwrap()
}

pub fn replica_config() -> ReplicaConfig {
    ReplicaConfig::new("app.models:Model")
}

pub fn config(replicas: u32) -> BackendConfig {
    BackendConfig::with_replicas(replicas)
}
