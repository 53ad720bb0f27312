//! Per-replica lifecycle state machine
//!
//! ```text
//! SHOULD_START --start()--> STARTING --check_started()--> RUNNING
//! RUNNING --set_should_stop()--> SHOULD_STOP --stop()--> STOPPING --check_stopped()--> STOPPED
//! STARTING --set_should_stop()--> SHOULD_STOP
//! ```
//!
//! Every step that touches the runtime is name-based, so re-running `start()`
//! or `stop()` after a controller crash never creates a duplicate worker or
//! fails on a worker that is already gone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{BackendTag, ReplicaTag};
use crate::runtime::{
    Completion, CompletionStatus, RuntimeError, WorkerHandle, WorkerRuntime, WorkerSpec,
};

// ============================================================================
// Replica State
// ============================================================================

/// Lifecycle state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    ShouldStart,
    Starting,
    Running,
    ShouldStop,
    Stopping,
    Stopped,
}

impl ReplicaState {
    /// All states in lifecycle order
    pub const ALL: [ReplicaState; 6] = [
        Self::ShouldStart,
        Self::Starting,
        Self::Running,
        Self::ShouldStop,
        Self::Stopping,
        Self::Stopped,
    ];

    /// Position in [`ReplicaState::ALL`]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether the replica counts towards the backend's live replicas
    pub fn is_live(self) -> bool {
        matches!(self, Self::ShouldStart | Self::Starting | Self::Running)
    }

    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShouldStart => "SHOULD_START",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::ShouldStop => "SHOULD_STOP",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stop Sequence
// ============================================================================

/// Drain-then-terminate sequence issued by [`ReplicaInstance::stop`]
///
/// Polled from the reconciliation tick. The worker is always terminated once
/// the drain finishes or the graceful deadline passes.
#[derive(Debug)]
pub enum StopSequence {
    /// Waiting for the drain to finish
    Draining {
        handle: WorkerHandle,
        drain: Completion,
        deadline: Instant,
    },

    /// Worker is gone
    Finished,
}

impl StopSequence {
    /// Advance the sequence. Returns true once the worker is gone.
    fn poll(&mut self, runtime: &dyn WorkerRuntime) -> Result<bool, RuntimeError> {
        let StopSequence::Draining {
            handle,
            drain,
            deadline,
        } = self
        else {
            return Ok(true);
        };

        match drain.poll() {
            CompletionStatus::Done => {}
            CompletionStatus::Failed(reason) => {
                tracing::warn!(worker = %handle, reason = %reason, "Drain failed, terminating");
            }
            CompletionStatus::Pending if Instant::now() >= *deadline => {
                tracing::warn!(worker = %handle, "Graceful shutdown timed out, force-killing");
                crate::metrics::record_forced_termination();
            }
            CompletionStatus::Pending => return Ok(false),
        }

        runtime.terminate(handle)?;
        *self = StopSequence::Finished;
        Ok(true)
    }
}

// ============================================================================
// Replica Instance
// ============================================================================

/// Persistable view of a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub replica_tag: ReplicaTag,
    pub backend_tag: BackendTag,
    pub worker_name: String,
    pub state: ReplicaState,
    pub graceful_timeout_ms: u64,
    #[serde(default)]
    pub abandoned: bool,
}

/// One replica of a backend and its in-flight runtime operations
#[derive(Debug)]
pub struct ReplicaInstance {
    replica_tag: ReplicaTag,
    backend_tag: BackendTag,
    worker_name: String,
    state: ReplicaState,
    handle: Option<WorkerHandle>,
    startup: Option<Completion>,
    shutdown: Option<StopSequence>,
    graceful_timeout: Duration,
    abandoned: bool,
}

impl ReplicaInstance {
    /// Create a replica in SHOULD_START with a fresh tag
    pub fn new(controller_name: &str, backend_tag: &BackendTag) -> Self {
        Self::with_tag(controller_name, backend_tag, ReplicaTag::generate(backend_tag))
    }

    /// Create a replica in SHOULD_START with a known tag
    pub fn with_tag(controller_name: &str, backend_tag: &BackendTag, replica_tag: ReplicaTag) -> Self {
        Self {
            worker_name: worker_name(controller_name, &replica_tag),
            replica_tag,
            backend_tag: backend_tag.clone(),
            state: ReplicaState::ShouldStart,
            handle: None,
            startup: None,
            shutdown: None,
            graceful_timeout: Duration::ZERO,
            abandoned: false,
        }
    }

    /// Rebuild a replica from a snapshot. Call [`recover`] before use.
    ///
    /// [`recover`]: ReplicaInstance::recover
    pub fn from_snapshot(snapshot: ReplicaSnapshot) -> Self {
        Self {
            replica_tag: snapshot.replica_tag,
            backend_tag: snapshot.backend_tag,
            worker_name: snapshot.worker_name,
            state: snapshot.state,
            handle: None,
            startup: None,
            shutdown: None,
            graceful_timeout: Duration::from_millis(snapshot.graceful_timeout_ms),
            abandoned: snapshot.abandoned,
        }
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            replica_tag: self.replica_tag.clone(),
            backend_tag: self.backend_tag.clone(),
            worker_name: self.worker_name.clone(),
            state: self.state,
            graceful_timeout_ms: u64::try_from(self.graceful_timeout.as_millis()).unwrap_or(u64::MAX),
            abandoned: self.abandoned,
        }
    }

    pub fn replica_tag(&self) -> &ReplicaTag {
        &self.replica_tag
    }

    pub fn backend_tag(&self) -> &BackendTag {
        &self.backend_tag
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    /// Graceful timeout resolved by the last `set_should_stop`
    pub fn graceful_timeout(&self) -> Duration {
        self.graceful_timeout
    }

    /// Whether a start was abandoned while in STARTING
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Callable handle; only available while RUNNING
    pub fn get_handle(&self) -> Option<&WorkerHandle> {
        match self.state {
            ReplicaState::Running => self.handle.as_ref(),
            _ => None,
        }
    }

    fn transition(&mut self, to: ReplicaState) {
        tracing::debug!(
            replica = %self.replica_tag,
            backend = %self.backend_tag,
            from = %self.state,
            to = %to,
            "Replica transition"
        );
        self.state = to;
    }

    /// Attach to or create the worker. SHOULD_START -> STARTING.
    pub fn start(&mut self, runtime: &dyn WorkerRuntime, spec: WorkerSpec) -> Result<(), RuntimeError> {
        assert_eq!(
            self.state,
            ReplicaState::ShouldStart,
            "start() called on replica {} in state {}",
            self.replica_tag,
            self.state
        );
        debug_assert_eq!(spec.name, self.worker_name);

        let (handle, startup) = match runtime.lookup(&self.worker_name)? {
            Some(handle) => {
                tracing::debug!(replica = %self.replica_tag, worker = %handle, "Worker already exists");
                let ready = runtime.ready(&handle)?;
                (handle, ready)
            }
            None => {
                tracing::info!(
                    replica = %self.replica_tag,
                    backend = %self.backend_tag,
                    "Starting replica"
                );
                runtime.create(spec)?
            }
        };

        self.handle = Some(handle);
        self.startup = Some(startup);
        self.transition(ReplicaState::Starting);
        Ok(())
    }

    /// Zero-timeout readiness poll. STARTING -> RUNNING when ready.
    pub fn check_started(&mut self) -> Result<bool, RuntimeError> {
        assert_eq!(
            self.state,
            ReplicaState::Starting,
            "check_started() called on replica {} in state {}",
            self.replica_tag,
            self.state
        );

        let status = match self.startup.as_mut() {
            Some(startup) => startup.poll(),
            None => CompletionStatus::Done,
        };
        match status {
            CompletionStatus::Pending => Ok(false),
            CompletionStatus::Done => {
                self.startup = None;
                self.transition(ReplicaState::Running);
                Ok(true)
            }
            CompletionStatus::Failed(reason) => Err(RuntimeError::Startup {
                name: self.worker_name.clone(),
                reason,
            }),
        }
    }

    /// Record the graceful timeout and mark for stopping
    ///
    /// A replica that is still STARTING is abandoned: its timeout resolves to
    /// zero so the half-created worker is force-terminated by `stop()`.
    pub fn set_should_stop(&mut self, graceful_timeout: Duration) {
        assert!(
            self.state.is_live(),
            "set_should_stop() called on replica {} in state {}",
            self.replica_tag,
            self.state
        );

        if self.state == ReplicaState::Starting {
            self.abandoned = true;
            self.graceful_timeout = Duration::ZERO;
            self.startup = None;
        } else {
            self.graceful_timeout = graceful_timeout;
        }
        self.transition(ReplicaState::ShouldStop);
    }

    /// Issue the drain-then-terminate sequence. SHOULD_STOP -> STOPPING.
    pub fn stop(&mut self, runtime: &dyn WorkerRuntime) -> Result<(), RuntimeError> {
        assert_eq!(
            self.state,
            ReplicaState::ShouldStop,
            "stop() called on replica {} in state {}",
            self.replica_tag,
            self.state
        );

        let sequence = match runtime.lookup(&self.worker_name)? {
            None => {
                tracing::debug!(replica = %self.replica_tag, "Worker already gone");
                StopSequence::Finished
            }
            Some(handle) if self.graceful_timeout.is_zero() => {
                tracing::warn!(
                    replica = %self.replica_tag,
                    abandoned = self.abandoned,
                    "Force-killing replica"
                );
                runtime.terminate(&handle)?;
                crate::metrics::record_forced_termination();
                StopSequence::Finished
            }
            Some(handle) => {
                tracing::info!(
                    replica = %self.replica_tag,
                    timeout_ms = self.graceful_timeout.as_millis() as u64,
                    "Draining replica"
                );
                let drain = runtime.drain(&handle)?;
                StopSequence::Draining {
                    handle,
                    drain,
                    deadline: Instant::now() + self.graceful_timeout,
                }
            }
        };

        self.handle = None;
        self.shutdown = Some(sequence);
        self.transition(ReplicaState::Stopping);
        Ok(())
    }

    /// Non-blocking poll of the stop sequence. STOPPING -> STOPPED when done.
    pub fn check_stopped(&mut self, runtime: &dyn WorkerRuntime) -> Result<bool, RuntimeError> {
        assert_eq!(
            self.state,
            ReplicaState::Stopping,
            "check_stopped() called on replica {} in state {}",
            self.replica_tag,
            self.state
        );

        let done = match self.shutdown.as_mut() {
            Some(sequence) => sequence.poll(runtime)?,
            None => true,
        };
        if done {
            self.shutdown = None;
            self.transition(ReplicaState::Stopped);
        }
        Ok(done)
    }

    /// Re-attach to the runtime after being restored from a checkpoint
    ///
    /// Intents (SHOULD_START, SHOULD_STOP) are left for the next tick.
    /// STARTING and STOPPING re-issue their operation by name. RUNNING
    /// re-acquires its handle, or restarts through STARTING if the worker is
    /// gone. Without a spec (the backend's metadata is gone) a STARTING or
    /// RUNNING replica is marked for immediate termination instead.
    pub fn recover(
        &mut self,
        runtime: &dyn WorkerRuntime,
        spec: Option<WorkerSpec>,
    ) -> Result<(), RuntimeError> {
        match (self.state, spec) {
            (ReplicaState::ShouldStart | ReplicaState::ShouldStop | ReplicaState::Stopped, _) => Ok(()),
            (ReplicaState::Starting | ReplicaState::Running, None) => {
                tracing::warn!(replica = %self.replica_tag, "Replica has no backend, stopping");
                self.set_should_stop(Duration::ZERO);
                Ok(())
            }
            (ReplicaState::Starting, Some(spec)) => {
                self.state = ReplicaState::ShouldStart;
                self.start(runtime, spec)
            }
            (ReplicaState::Running, Some(spec)) => match runtime.lookup(&self.worker_name)? {
                Some(handle) => {
                    self.handle = Some(handle);
                    Ok(())
                }
                None => {
                    tracing::warn!(replica = %self.replica_tag, "Running replica lost, restarting");
                    self.state = ReplicaState::ShouldStart;
                    self.start(runtime, spec)
                }
            },
            (ReplicaState::Stopping, _) => {
                self.state = ReplicaState::ShouldStop;
                self.stop(runtime)
            }
        }
    }
}

/// Stable runtime name of a replica's worker
pub fn worker_name(controller_name: &str, replica_tag: &ReplicaTag) -> String {
    format!("{controller_name}:{replica_tag}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReplicaConfig;
    use crate::runtime::{LifetimePolicy, LocalRuntime};

    fn replica() -> ReplicaInstance {
        ReplicaInstance::new("ctl", &BackendTag::new("svc").unwrap())
    }

    fn spec_for(replica: &ReplicaInstance) -> WorkerSpec {
        WorkerSpec::from_replica_config(
            replica.worker_name(),
            &ReplicaConfig::new("app:Model"),
            LifetimePolicy::Owned,
        )
    }

    fn running(runtime: &LocalRuntime) -> ReplicaInstance {
        let mut r = replica();
        let spec = spec_for(&r);
        r.start(runtime, spec).unwrap();
        runtime.mark_ready(r.worker_name());
        assert!(r.check_started().unwrap());
        r
    }

    #[test]
    fn test_worker_name_format() {
        let r = replica();
        assert_eq!(r.worker_name(), format!("ctl:{}", r.replica_tag()));
        assert_eq!(r.state(), ReplicaState::ShouldStart);
    }

    #[test]
    fn test_start_until_running() {
        let runtime = LocalRuntime::manual();
        let mut r = replica();
        let spec = spec_for(&r);

        r.start(&runtime, spec).unwrap();
        assert_eq!(r.state(), ReplicaState::Starting);
        assert!(r.get_handle().is_none());
        assert!(!r.check_started().unwrap());

        runtime.mark_ready(r.worker_name());
        assert!(r.check_started().unwrap());
        assert_eq!(r.state(), ReplicaState::Running);
        assert_eq!(r.get_handle().unwrap().name, r.worker_name());
    }

    #[test]
    fn test_start_reuses_existing_worker() {
        let runtime = LocalRuntime::manual();
        let mut first = replica();
        let spec = spec_for(&first);
        first.start(&runtime, spec.clone()).unwrap();

        let mut again = ReplicaInstance::from_snapshot(ReplicaSnapshot {
            state: ReplicaState::ShouldStart,
            ..first.snapshot()
        });
        again.start(&runtime, spec).unwrap();

        assert_eq!(runtime.creation_count(), 1);
    }

    #[test]
    fn test_startup_failure_propagates() {
        let runtime = LocalRuntime::manual();
        let mut r = replica();
        let spec = spec_for(&r);
        r.start(&runtime, spec).unwrap();

        runtime.fail_startup(r.worker_name(), "import error");
        let err = r.check_started().unwrap_err();
        assert!(matches!(err, RuntimeError::Startup { .. }));
    }

    #[test]
    fn test_graceful_stop() {
        let runtime = LocalRuntime::manual();
        let mut r = running(&runtime);

        r.set_should_stop(Duration::from_secs(30));
        assert_eq!(r.state(), ReplicaState::ShouldStop);
        assert_eq!(r.graceful_timeout(), Duration::from_secs(30));

        r.stop(&runtime).unwrap();
        assert_eq!(r.state(), ReplicaState::Stopping);
        assert!(!r.check_stopped(&runtime).unwrap());

        runtime.finish_drain(r.worker_name());
        assert!(r.check_stopped(&runtime).unwrap());
        assert_eq!(r.state(), ReplicaState::Stopped);
        assert!(!runtime.is_alive(r.worker_name()));
        assert!(runtime.forced_terminations().is_empty());
    }

    #[test]
    fn test_force_kill_with_zero_timeout() {
        let runtime = LocalRuntime::manual();
        let mut r = running(&runtime);

        r.set_should_stop(Duration::ZERO);
        r.stop(&runtime).unwrap();
        assert!(r.check_stopped(&runtime).unwrap());
        assert!(runtime.drain_requests().is_empty());
        assert_eq!(runtime.forced_terminations(), vec![r.worker_name().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_timeout_forces_termination() {
        let runtime = LocalRuntime::manual();
        let mut r = running(&runtime);

        r.set_should_stop(Duration::from_millis(100));
        r.stop(&runtime).unwrap();
        assert!(!r.check_stopped(&runtime).unwrap());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(r.check_stopped(&runtime).unwrap());
        assert_eq!(runtime.forced_terminations(), vec![r.worker_name().to_string()]);
    }

    #[test]
    fn test_abandoned_start_is_force_killed() {
        let runtime = LocalRuntime::manual();
        let mut r = replica();
        let spec = spec_for(&r);
        r.start(&runtime, spec).unwrap();

        r.set_should_stop(Duration::from_secs(30));
        assert!(r.is_abandoned());
        assert_eq!(r.graceful_timeout(), Duration::ZERO);

        r.stop(&runtime).unwrap();
        assert!(r.check_stopped(&runtime).unwrap());
        assert!(!runtime.is_alive(r.worker_name()));
    }

    #[test]
    fn test_stop_never_started_replica() {
        let runtime = LocalRuntime::manual();
        let mut r = replica();

        r.set_should_stop(Duration::from_secs(5));
        r.stop(&runtime).unwrap();
        assert!(r.check_stopped(&runtime).unwrap());
        assert!(runtime.terminated().is_empty());
    }

    #[test]
    fn test_recover_running_reacquires_handle() {
        let runtime = LocalRuntime::manual();
        let r = running(&runtime);

        let mut restored = ReplicaInstance::from_snapshot(r.snapshot());
        assert!(restored.get_handle().is_none());
        let spec = spec_for(&restored);
        restored.recover(&runtime, Some(spec)).unwrap();

        assert_eq!(restored.state(), ReplicaState::Running);
        assert!(restored.get_handle().is_some());
        assert_eq!(runtime.creation_count(), 1);
    }

    #[test]
    fn test_recover_lost_running_replica_restarts() {
        let runtime = LocalRuntime::manual();
        let r = running(&runtime);
        runtime.kill(r.worker_name());

        let mut restored = ReplicaInstance::from_snapshot(r.snapshot());
        let spec = spec_for(&restored);
        restored.recover(&runtime, Some(spec)).unwrap();

        assert_eq!(restored.state(), ReplicaState::Starting);
        assert_eq!(runtime.creation_count(), 2);
    }

    #[test]
    fn test_recover_stopping_reissues_stop() {
        let runtime = LocalRuntime::manual();
        let mut r = running(&runtime);
        r.set_should_stop(Duration::from_secs(30));
        r.stop(&runtime).unwrap();

        let mut restored = ReplicaInstance::from_snapshot(r.snapshot());
        let spec = spec_for(&restored);
        restored.recover(&runtime, Some(spec)).unwrap();
        assert_eq!(restored.state(), ReplicaState::Stopping);

        runtime.finish_drain(restored.worker_name());
        assert!(restored.check_stopped(&runtime).unwrap());
    }

    #[test]
    fn test_recover_without_backend_marks_for_stop() {
        let runtime = LocalRuntime::manual();
        let r = running(&runtime);

        let mut restored = ReplicaInstance::from_snapshot(r.snapshot());
        restored.recover(&runtime, None).unwrap();
        assert_eq!(restored.state(), ReplicaState::ShouldStop);
        assert_eq!(restored.graceful_timeout(), Duration::ZERO);
    }

    #[test]
    #[should_panic(expected = "start() called on replica")]
    fn test_out_of_order_transition_panics() {
        let runtime = LocalRuntime::manual();
        let mut r = running(&runtime);
        let spec = spec_for(&r);
        let _ = r.start(&runtime, spec);
    }

    #[test]
    fn test_snapshot_serializes_state_names() {
        let r = replica();
        let json = serde_json::to_value(r.snapshot()).unwrap();
        assert_eq!(json["state"], "SHOULD_START");
    }
}
