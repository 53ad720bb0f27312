//! Backend reconciliation
//!
//! [`BackendController`] holds the desired state (installed backends and
//! their target replica counts) and the actual state (replicas bucketed by
//! lifecycle state). Control-plane calls only record intents and checkpoint
//! them; [`BackendController::update`] is the tick that carries intents out
//! against the worker runtime and observes their completion.
//!
//! The controller is not safe for concurrent use. Every mutating call,
//! `update()` included, must be serialized by the caller; [`ControllerHandle`]
//! does that with an async mutex.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use backend_controller::admission::Unbounded;
//! use backend_controller::config::ControllerOptions;
//! use backend_controller::controller::BackendController;
//! use backend_controller::models::{BackendConfig, BackendTag, ReplicaConfig};
//! use backend_controller::notifications::LongPollHost;
//! use backend_controller::runtime::LocalRuntime;
//! use backend_controller::storage::MemoryKvStore;
//!
//! # fn example() -> backend_controller::error::Result<()> {
//! let mut controller = BackendController::new(
//!     ControllerOptions::default(),
//!     Arc::new(LocalRuntime::manual()),
//!     Arc::new(Unbounded),
//!     Arc::new(MemoryKvStore::new()),
//!     Arc::new(LongPollHost::new()),
//! )?;
//!
//! let tag = BackendTag::new("svc-a")?;
//! let _goal = controller.create_backend(&tag, BackendConfig::with_replicas(2), ReplicaConfig::new("app:Model"))?;
//! controller.update()?;
//! # Ok(())
//! # }
//! ```

pub mod buckets;
pub mod driver;

pub use buckets::{ReplicaBuckets, ReplicaTable};
pub use driver::ControllerHandle;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::admission::ResourceScheduler;
use crate::config::ControllerOptions;
use crate::error::{Error, Result};
use crate::goal::{GoalTracker, GoalWaiter};
use crate::metrics;
use crate::models::{
    BackendConfig, BackendConfigUpdate, BackendInfo, BackendTag, GoalId, ReplicaConfig,
};
use crate::notifications::{NotificationHost, Update};
use crate::replica::{ReplicaInstance, ReplicaSnapshot, ReplicaState};
use crate::runtime::{WorkerHandle, WorkerRuntime, WorkerSpec};
use crate::storage::{checkpoint, CheckpointError, KvStore};

/// States a scale-down pulls replicas from, in priority order
const SCALE_DOWN_ORDER: [ReplicaState; 3] = [
    ReplicaState::ShouldStart,
    ReplicaState::Starting,
    ReplicaState::Running,
];

// ============================================================================
// Snapshot
// ============================================================================

/// Everything the controller checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub replicas: BTreeMap<BackendTag, Vec<ReplicaSnapshot>>,
    pub backends: BTreeMap<BackendTag, BackendInfo>,
    pub targets: BTreeMap<BackendTag, u32>,
    pub backend_goals: BTreeMap<BackendTag, GoalId>,
    pub pending_goals: BTreeSet<GoalId>,
}

impl ControllerSnapshot {
    /// Number of replicas per state across all backends
    pub fn count_by_state(&self) -> BTreeMap<ReplicaState, usize> {
        let mut counts = BTreeMap::new();
        for replica in self.replicas.values().flatten() {
            *counts.entry(replica.state).or_insert(0) += 1;
        }
        counts
    }

    /// Total replicas
    pub fn replica_count(&self) -> usize {
        self.replicas.values().map(Vec::len).sum()
    }
}

// ============================================================================
// Backend Controller
// ============================================================================

/// Reconciling state machine for all backends
pub struct BackendController {
    options: ControllerOptions,
    runtime: Arc<dyn WorkerRuntime>,
    scheduler: Arc<dyn ResourceScheduler>,
    kv_store: Arc<dyn KvStore>,
    notifier: Arc<dyn NotificationHost>,
    goals: GoalTracker,
    backends: BTreeMap<BackendTag, BackendInfo>,
    targets: BTreeMap<BackendTag, u32>,
    replicas: ReplicaTable,
    backend_goals: BTreeMap<BackendTag, GoalId>,
}

impl std::fmt::Debug for BackendController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendController")
            .field("name", &self.options.name)
            .field("backends", &self.backends.len())
            .field("replicas", &self.replicas.total())
            .field("pending_goals", &self.goals.len())
            .finish()
    }
}

impl BackendController {
    /// Create a controller, restoring from the last checkpoint if present
    ///
    /// Config and handle snapshots are published to the notifier right away
    /// so listeners see the recovered state.
    pub fn new(
        options: ControllerOptions,
        runtime: Arc<dyn WorkerRuntime>,
        scheduler: Arc<dyn ResourceScheduler>,
        kv_store: Arc<dyn KvStore>,
        notifier: Arc<dyn NotificationHost>,
    ) -> Result<Self> {
        options.validate()?;

        let mut controller = Self {
            options,
            runtime,
            scheduler,
            kv_store,
            notifier,
            goals: GoalTracker::new(),
            backends: BTreeMap::new(),
            targets: BTreeMap::new(),
            replicas: ReplicaTable::new(),
            backend_goals: BTreeMap::new(),
        };

        controller.recover()?;
        controller.notify_backend_configs_changed();
        controller.notify_replica_handles_changed();
        controller.publish_replica_metrics();
        Ok(controller)
    }

    fn recover(&mut self) -> Result<()> {
        let Some(checkpoint) = checkpoint::load::<ControllerSnapshot>(
            self.kv_store.as_ref(),
            &self.options.checkpoint_key,
        )?
        else {
            tracing::info!(controller = %self.options.name, "No checkpoint found, starting fresh");
            return Ok(());
        };

        if checkpoint.controller != self.options.name {
            tracing::warn!(
                written_by = %checkpoint.controller,
                controller = %self.options.name,
                "Checkpoint was written by a different controller"
            );
        }

        let snapshot = checkpoint.state;
        self.backends = snapshot.backends;
        self.targets = snapshot.targets;
        self.backend_goals = snapshot.backend_goals;

        // Goals superseded after the last checkpoint are still listed as
        // pending but no backend references them any more.
        let live_goals: BTreeSet<GoalId> = self.backend_goals.values().copied().collect();
        for goal in &snapshot.pending_goals {
            self.goals.register_pending(*goal);
            if !live_goals.contains(goal) {
                self.goals.complete_goal(*goal);
            }
        }

        let lifetime = self.options.lifetime();
        let runtime = self.runtime.as_ref();
        for (tag, replicas) in snapshot.replicas {
            let replica_config = self.backends.get(&tag).map(|info| &info.replica_config);
            let buckets = self.replicas.entry(&tag);
            for saved in replicas {
                let mut replica = ReplicaInstance::from_snapshot(saved);
                let spec = replica_config.map(|config| {
                    WorkerSpec::from_replica_config(replica.worker_name(), config, lifetime)
                });
                replica.recover(runtime, spec)?;
                buckets.push(replica);
            }
        }

        tracing::info!(
            controller = %self.options.name,
            written_at = %checkpoint.written_at,
            backends = self.backends.len(),
            replicas = self.replicas.total(),
            pending_goals = self.goals.len(),
            "Recovered from checkpoint"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Control-plane operations
    // ------------------------------------------------------------------------

    /// Install a backend and scale it to its configured replica count
    ///
    /// Returns `None` without doing anything if the same configs are already
    /// installed. On a rejected scale-up the previous metadata is restored and
    /// nothing is checkpointed.
    #[instrument(skip_all, fields(backend = %tag))]
    pub fn create_backend(
        &mut self,
        tag: &BackendTag,
        backend_config: BackendConfig,
        replica_config: ReplicaConfig,
    ) -> Result<Option<GoalId>> {
        backend_config.validate()?;
        replica_config.validate()?;

        if let Some(existing) = self.backends.get(tag) {
            if existing.matches(&backend_config, &replica_config) {
                tracing::debug!("Backend already installed with identical config");
                return Ok(None);
            }
        }

        let target = backend_config.num_replicas;
        let previous_info = self
            .backends
            .insert(tag.clone(), BackendInfo::new(backend_config, replica_config));
        let previous_target = self.targets.insert(tag.clone(), target);

        if let Err(e) = self.scale_backend_replicas(tag, false) {
            restore(&mut self.backends, tag, previous_info);
            restore(&mut self.targets, tag, previous_target);
            return Err(e);
        }

        let (goal, superseded) = self.replace_goal(tag);
        tracing::info!(target_replicas = target, goal = %goal, "Backend created");

        self.commit(superseded, true)?;
        Ok(Some(goal))
    }

    /// Scale a backend to zero and forget its metadata
    ///
    /// Unknown tags are a no-op. Replicas keep draining under an orphaned
    /// record until they stop, at which point the record is collected.
    #[instrument(skip(self), fields(backend = %tag))]
    pub fn delete_backend(&mut self, tag: &BackendTag, force_kill: bool) -> Result<Option<GoalId>> {
        if !self.backends.contains_key(tag) {
            tracing::debug!("Backend not registered, nothing to delete");
            return Ok(None);
        }

        self.targets.insert(tag.clone(), 0);
        self.scale_backend_replicas(tag, force_kill)?;
        self.backends.remove(tag);

        let (goal, superseded) = self.replace_goal(tag);
        tracing::info!(goal = %goal, force_kill, "Backend deleted");

        self.commit(superseded, true)?;
        Ok(Some(goal))
    }

    /// Merge a partial config onto a backend and rescale
    ///
    /// Listeners are only notified if something other than the replica count
    /// changed.
    #[instrument(skip(self, update), fields(backend = %tag))]
    pub fn update_backend_config(
        &mut self,
        tag: &BackendTag,
        update: &BackendConfigUpdate,
    ) -> Result<GoalId> {
        let info = self.backends.get_mut(tag).ok_or_else(|| Error::not_found(tag))?;
        let merged = update.apply(&info.backend_config)?;
        let target = merged.num_replicas;
        let previous = std::mem::replace(&mut info.backend_config, merged);
        let configs_changed = previous.differs_beyond_replicas(&info.backend_config);
        let previous_target = self.targets.insert(tag.clone(), target);

        if let Err(e) = self.scale_backend_replicas(tag, false) {
            if let Some(info) = self.backends.get_mut(tag) {
                info.backend_config = previous;
            }
            restore(&mut self.targets, tag, previous_target);
            return Err(e);
        }

        let (goal, superseded) = self.replace_goal(tag);
        tracing::info!(target_replicas = target, configs_changed, goal = %goal, "Backend config updated");

        self.commit(superseded, configs_changed)?;
        Ok(goal)
    }

    /// Force-delete every backend
    ///
    /// Returns the goals of the deletions. Drive `update()` until
    /// [`is_idle`](Self::is_idle) to let the terminations complete.
    pub fn shutdown(&mut self) -> Result<Vec<GoalId>> {
        let tags: Vec<BackendTag> = self.backends.keys().cloned().collect();
        tracing::info!(backends = tags.len(), "Shutting down all backends");

        let mut goals = Vec::with_capacity(tags.len());
        for tag in &tags {
            if let Some(goal) = self.delete_backend(tag, true)? {
                goals.push(goal);
            }
        }
        Ok(goals)
    }

    /// Remove the checkpoint key
    pub fn clear_checkpoint(&self) -> Result<()> {
        self.kv_store
            .delete(&self.options.checkpoint_key)
            .map_err(CheckpointError::from)?;
        tracing::info!(key = %self.options.checkpoint_key, "Checkpoint cleared");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Scaling
    // ------------------------------------------------------------------------

    /// Record start or stop intents that move a backend to its target
    ///
    /// Scale-ups are admission-checked as a whole: either every new replica is
    /// schedulable and all of them are added, or nothing changes.
    fn scale_backend_replicas(&mut self, tag: &BackendTag, force_kill: bool) -> Result<()> {
        let Some(info) = self.backends.get(tag) else {
            panic!("scaling unregistered backend {tag}");
        };
        let target = self.targets.get(tag).copied().unwrap_or(0);
        let current = self.replicas.get(tag).map_or(0, ReplicaBuckets::live_count);
        let delta = i64::from(target) - current as i64;

        tracing::debug!(
            backend = %tag,
            target,
            current,
            weighted = self.replicas.get(tag).map_or(0, ReplicaBuckets::weighted_count),
            delta,
            "Scaling backend"
        );

        if delta > 0 {
            let requested = delta as usize;
            if self.options.resource_check_enabled {
                let requirements = vec![info.replica_config.resources.clone(); requested];
                let schedulable = self
                    .scheduler
                    .can_schedule(&requirements)
                    .into_iter()
                    .filter(|ok| *ok)
                    .count();
                if schedulable < requested {
                    metrics::record_capacity_rejection(tag.as_str());
                    tracing::warn!(
                        backend = %tag,
                        target,
                        requested,
                        schedulable,
                        "Scale-up rejected by admission check"
                    );
                    return Err(Error::CapacityExceeded {
                        tag: tag.clone(),
                        target,
                        requested,
                        schedulable,
                    });
                }
            }

            let buckets = self.replicas.entry(tag);
            for _ in 0..requested {
                buckets.push(ReplicaInstance::new(&self.options.name, tag));
            }
            tracing::info!(backend = %tag, added = requested, "Adding replicas");
        } else if delta < 0 {
            let graceful_timeout = if force_kill {
                Duration::ZERO
            } else {
                info.backend_config.graceful_shutdown_timeout()
            };

            let buckets = self.replicas.entry(tag);
            for _ in 0..delta.unsigned_abs() {
                let Some(mut replica) = SCALE_DOWN_ORDER
                    .into_iter()
                    .find_map(|state| buckets.pop_newest(state))
                else {
                    panic!("no live replica left to stop for backend {tag}");
                };
                replica.set_should_stop(graceful_timeout);
                buckets.push(replica);
            }
            tracing::info!(
                backend = %tag,
                removed = delta.unsigned_abs(),
                timeout_ms = graceful_timeout.as_millis() as u64,
                "Removing replicas"
            );
        }

        Ok(())
    }

    /// Issue a new goal for a backend, returning the one it supersedes
    fn replace_goal(&mut self, tag: &BackendTag) -> (GoalId, Option<GoalId>) {
        let goal = self.goals.create_goal();
        let superseded = self.backend_goals.insert(tag.clone(), goal);
        (goal, superseded)
    }

    /// Persist a mutation, then make it visible
    ///
    /// This is the only place a superseded goal is completed.
    fn commit(&mut self, superseded: Option<GoalId>, configs_changed: bool) -> Result<()> {
        self.checkpoint()?;
        if configs_changed {
            self.notify_backend_configs_changed();
        }
        if let Some(goal) = superseded {
            tracing::debug!(goal = %goal, "Goal superseded");
            self.goals.complete_goal(goal);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    /// Run one reconciliation tick. Returns whether any replica moved.
    ///
    /// Runtime failures leave the failing replica in its previous bucket and
    /// are returned to the caller, which should restart the controller from
    /// its checkpoint.
    pub fn update(&mut self) -> Result<bool> {
        let _timer = metrics::start_tick_timer();
        self.tick().inspect_err(|e| {
            tracing::error!(error = %e, "Reconciliation tick failed");
        })
    }

    fn tick(&mut self) -> Result<bool> {
        for goal in self.completed_goals() {
            tracing::info!(goal = %goal, "Goal reached");
            self.goals.complete_goal(goal);
        }

        let mut changed = self.start_replicas()?;
        changed |= self.stop_replicas()?;
        changed |= self.poll_starting()?;
        changed |= self.poll_stopping()?;
        changed |= self.collect_garbage();

        if changed {
            self.checkpoint()?;
            self.notify_replica_handles_changed();
        }
        self.publish_replica_metrics();

        tracing::debug!(changed, replicas = self.replicas.total(), "Tick complete");
        Ok(changed)
    }

    /// Goals whose backend now has exactly the target number of RUNNING
    /// replicas
    fn completed_goals(&self) -> Vec<GoalId> {
        self.backend_goals
            .iter()
            .filter(|(_, goal)| self.goals.is_pending(goal))
            .filter(|(tag, _)| {
                let target = self.targets.get(*tag).copied().unwrap_or(0) as usize;
                let running = self.replicas.count(tag, ReplicaState::Running);
                (target == 0 && running == 0) || (target > 0 && running == target)
            })
            .map(|(_, goal)| *goal)
            .collect()
    }

    fn start_replicas(&mut self) -> Result<bool> {
        let lifetime = self.options.lifetime();
        let runtime = self.runtime.as_ref();
        let mut changed = false;

        for (tag, buckets) in self.replicas.iter_mut() {
            let mut pending = buckets.take(ReplicaState::ShouldStart);
            if pending.is_empty() {
                continue;
            }
            let Some(info) = self.backends.get(tag) else {
                panic!("backend {tag} has replicas to start but no metadata");
            };

            while let Some(mut replica) = pending.pop_front() {
                let spec = WorkerSpec::from_replica_config(
                    replica.worker_name(),
                    &info.replica_config,
                    lifetime,
                );
                if let Err(e) = replica.start(runtime, spec) {
                    pending.push_front(replica);
                    buckets.restore(ReplicaState::ShouldStart, pending);
                    return Err(e.into());
                }
                buckets.push(replica);
                changed = true;
            }
        }
        Ok(changed)
    }

    fn stop_replicas(&mut self) -> Result<bool> {
        let runtime = self.runtime.as_ref();
        let mut changed = false;

        for (_, buckets) in self.replicas.iter_mut() {
            let mut pending = buckets.take(ReplicaState::ShouldStop);
            while let Some(mut replica) = pending.pop_front() {
                if let Err(e) = replica.stop(runtime) {
                    pending.push_front(replica);
                    buckets.restore(ReplicaState::ShouldStop, pending);
                    return Err(e.into());
                }
                buckets.push(replica);
                changed = true;
            }
        }
        Ok(changed)
    }

    fn poll_starting(&mut self) -> Result<bool> {
        let mut changed = false;

        for (_, buckets) in self.replicas.iter_mut() {
            let mut starting = buckets.take(ReplicaState::Starting);
            while let Some(mut replica) = starting.pop_front() {
                match replica.check_started() {
                    Ok(ready) => {
                        if ready {
                            tracing::info!(
                                replica = %replica.replica_tag(),
                                backend = %replica.backend_tag(),
                                "Replica running"
                            );
                            changed = true;
                        }
                        buckets.push(replica);
                    }
                    Err(e) => {
                        starting.push_front(replica);
                        buckets.restore(ReplicaState::Starting, starting);
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(changed)
    }

    fn poll_stopping(&mut self) -> Result<bool> {
        let runtime = self.runtime.as_ref();
        let mut changed = false;

        for (_, buckets) in self.replicas.iter_mut() {
            let mut stopping = buckets.take(ReplicaState::Stopping);
            while let Some(mut replica) = stopping.pop_front() {
                match replica.check_stopped(runtime) {
                    Ok(true) => {
                        tracing::info!(
                            replica = %replica.replica_tag(),
                            backend = %replica.backend_tag(),
                            "Replica stopped"
                        );
                        changed = true;
                    }
                    Ok(false) => buckets.push(replica),
                    Err(e) => {
                        stopping.push_front(replica);
                        buckets.restore(ReplicaState::Stopping, stopping);
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Forget deleted backends whose last replica has stopped
    fn collect_garbage(&mut self) -> bool {
        let orphaned: Vec<BackendTag> = self
            .targets
            .keys()
            .filter(|tag| !self.backends.contains_key(*tag))
            .filter(|tag| self.replicas.get(tag).map_or(true, ReplicaBuckets::is_empty))
            .cloned()
            .collect();

        for tag in &orphaned {
            self.replicas.remove(tag);
            self.targets.remove(tag);
            if let Some(goal) = self.backend_goals.remove(tag) {
                self.goals.complete_goal(goal);
            }
            let states = ReplicaState::ALL.map(ReplicaState::as_str);
            metrics::remove_backend(tag.as_str(), &states);
            tracing::info!(backend = %tag, "Backend garbage-collected");
        }
        !orphaned.is_empty()
    }

    // ------------------------------------------------------------------------
    // Persistence and notifications
    // ------------------------------------------------------------------------

    /// Full state as written to the checkpoint
    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            replicas: self
                .replicas
                .iter()
                .map(|(tag, buckets)| {
                    (tag.clone(), buckets.iter_all().map(ReplicaInstance::snapshot).collect())
                })
                .collect(),
            backends: self.backends.clone(),
            targets: self.targets.clone(),
            backend_goals: self.backend_goals.clone(),
            pending_goals: self.goals.get_pending_goal_ids().into_iter().collect(),
        }
    }

    fn checkpoint(&self) -> Result<()> {
        let bytes = checkpoint::save(
            self.kv_store.as_ref(),
            &self.options.checkpoint_key,
            &self.options.name,
            &self.snapshot(),
        )?;
        metrics::record_checkpoint_written(bytes);
        Ok(())
    }

    fn notify_backend_configs_changed(&self) {
        self.notifier
            .notify_changed(Update::BackendConfigs(self.get_backend_configs()));
    }

    fn notify_replica_handles_changed(&self) {
        self.notifier
            .notify_changed(Update::ReplicaHandles(self.get_replica_handles()));
    }

    fn publish_replica_metrics(&self) {
        for (tag, buckets) in self.replicas.iter() {
            for (state, count) in buckets.counts() {
                metrics::set_replica_count(tag.as_str(), state.as_str(), count);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------------

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    /// Installed metadata for a backend
    pub fn get_backend(&self, tag: &BackendTag) -> Option<&BackendInfo> {
        self.backends.get(tag)
    }

    /// Config of every installed backend
    pub fn get_backend_configs(&self) -> BTreeMap<BackendTag, BackendConfig> {
        self.backends
            .iter()
            .map(|(tag, info)| (tag.clone(), info.backend_config.clone()))
            .collect()
    }

    /// Handles of RUNNING replicas per backend
    pub fn get_replica_handles(&self) -> BTreeMap<BackendTag, Vec<WorkerHandle>> {
        self.replicas
            .iter()
            .map(|(tag, buckets)| {
                let handles = buckets
                    .iter(ReplicaState::Running)
                    .filter_map(ReplicaInstance::get_handle)
                    .cloned()
                    .collect();
                (tag.clone(), handles)
            })
            .collect()
    }

    /// Tags of installed backends
    pub fn backend_tags(&self) -> Vec<BackendTag> {
        self.backends.keys().cloned().collect()
    }

    /// Replica counts per state for a backend, including orphaned records
    pub fn replica_counts(&self, tag: &BackendTag) -> BTreeMap<ReplicaState, usize> {
        ReplicaState::ALL
            .into_iter()
            .map(|state| (state, self.replicas.count(tag, state)))
            .collect()
    }

    /// Number of replicas of a backend in one state
    pub fn replica_count(&self, tag: &BackendTag, state: ReplicaState) -> usize {
        self.replicas.count(tag, state)
    }

    /// Read-only view of the replica table
    pub fn replicas(&self) -> &ReplicaTable {
        &self.replicas
    }

    pub fn target_replicas(&self, tag: &BackendTag) -> Option<u32> {
        self.targets.get(tag).copied()
    }

    /// Current goal of a backend
    pub fn goal_for(&self, tag: &BackendTag) -> Option<GoalId> {
        self.backend_goals.get(tag).copied()
    }

    /// Waiter for a goal; resolves at once for unknown or completed goals
    pub fn watch_goal(&self, goal: GoalId) -> GoalWaiter {
        self.goals.watch(goal)
    }

    pub fn is_goal_pending(&self, goal: &GoalId) -> bool {
        self.goals.is_pending(goal)
    }

    /// Whether no replica exists in any state
    pub fn is_idle(&self) -> bool {
        self.replicas.total() == 0
    }
}

fn restore<V>(map: &mut BTreeMap<BackendTag, V>, tag: &BackendTag, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(tag.clone(), value);
        }
        None => {
            map.remove(tag);
        }
    }
}
