//! Async driver for a [`BackendController`]
//!
//! The controller itself is synchronous and single-threaded. This wrapper
//! serializes access behind an async mutex, runs the periodic reconciliation
//! loop and lets callers await goals without holding the lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::BackendController;
use crate::error::{Error, Result};
use crate::models::{BackendConfig, BackendConfigUpdate, BackendTag, GoalId, ReplicaConfig};

/// Shared, lock-serialized access to a controller
#[derive(Clone)]
pub struct ControllerHandle {
    inner: Arc<Mutex<BackendController>>,
}

impl ControllerHandle {
    /// Create a new handle owning the controller
    pub fn new(controller: BackendController) -> Self {
        Self {
            inner: Arc::new(Mutex::new(controller)),
        }
    }

    pub async fn create_backend(
        &self,
        tag: &BackendTag,
        backend_config: BackendConfig,
        replica_config: ReplicaConfig,
    ) -> Result<Option<GoalId>> {
        self.inner
            .lock()
            .await
            .create_backend(tag, backend_config, replica_config)
    }

    pub async fn update_backend_config(
        &self,
        tag: &BackendTag,
        update: &BackendConfigUpdate,
    ) -> Result<GoalId> {
        self.inner.lock().await.update_backend_config(tag, update)
    }

    pub async fn delete_backend(&self, tag: &BackendTag, force_kill: bool) -> Result<Option<GoalId>> {
        self.inner.lock().await.delete_backend(tag, force_kill)
    }

    /// Run one reconciliation tick
    pub async fn update(&self) -> Result<bool> {
        self.inner.lock().await.update()
    }

    /// Wait until a goal completes
    ///
    /// The lock is only held while subscribing, so the control loop keeps
    /// ticking while the caller waits.
    pub async fn wait_for_goal(&self, goal: GoalId) {
        let waiter = self.inner.lock().await.watch_goal(goal);
        waiter.wait().await;
    }

    /// Run a closure against the controller under the lock
    pub async fn with<R>(&self, f: impl FnOnce(&BackendController) -> R) -> R {
        let controller = self.inner.lock().await;
        f(&controller)
    }

    /// Tick the controller every `interval` until `shutdown` flips to true
    ///
    /// The loop exits on the first failed tick and returns its error; the
    /// owner is expected to rebuild the controller from its checkpoint.
    /// On a clean exit the number of ticks run is returned.
    pub fn spawn_control_loop(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<u64>> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = 0u64;

            tracing::info!(interval_ms = interval.as_millis() as u64, "Control loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        handle.update().await?;
                        ticks += 1;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(ticks, "Control loop stopped");
            Ok::<_, Error>(ticks)
        })
    }

    /// Force-delete all backends, tick until every replica is gone, then
    /// clear the checkpoint
    pub async fn shutdown(&self, interval: Duration) -> Result<()> {
        let goals = self.inner.lock().await.shutdown()?;
        loop {
            let mut controller = self.inner.lock().await;
            controller.update()?;
            if controller.is_idle() {
                controller.clear_checkpoint()?;
                break;
            }
            drop(controller);
            tokio::time::sleep(interval).await;
        }
        tracing::info!(goals = goals.len(), "Controller shut down");
        Ok(())
    }
}
