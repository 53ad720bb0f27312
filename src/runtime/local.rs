//! In-process worker runtime
//!
//! Workers are plain records. In manual mode nothing progresses until the
//! owner calls [`LocalRuntime::mark_ready`] or [`LocalRuntime::finish_drain`],
//! which makes controller behavior fully deterministic. The automatic modes
//! resolve readiness and drains on their own and back the `backendctl run`
//! command.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Completion, CompletionSender, RuntimeError, WorkerHandle, WorkerRuntime, WorkerSpec};

/// Behavior switches for [`LocalRuntime`]
#[derive(Debug, Clone, Default)]
pub struct LocalRuntimeConfig {
    /// Workers report ready without being told to
    pub auto_ready: bool,

    /// Drains finish as soon as they are requested
    pub auto_drain: bool,

    /// Delay before an auto-ready worker reports ready
    pub startup_delay: Option<Duration>,
}

impl LocalRuntimeConfig {
    /// Nothing resolves until driven explicitly
    pub fn manual() -> Self {
        Self::default()
    }

    /// Readiness and drains resolve on their own
    pub fn automatic() -> Self {
        Self {
            auto_ready: true,
            auto_drain: true,
            startup_delay: None,
        }
    }

    /// Set the startup delay for auto-ready workers
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = Some(delay);
        self
    }
}

#[derive(Debug)]
struct LocalWorker {
    handle: WorkerHandle,
    spec: WorkerSpec,
    ready: bool,
    drain_requested: bool,
    drained: bool,
    ready_waiters: Vec<CompletionSender>,
    drain_waiters: Vec<CompletionSender>,
}

#[derive(Debug, Default)]
struct LocalState {
    workers: BTreeMap<String, LocalWorker>,
    next_id: u64,
    created: Vec<String>,
    drain_requests: Vec<String>,
    terminated: Vec<String>,
    forced: Vec<String>,
    create_failure: Option<String>,
}

/// Worker runtime that keeps workers in memory
///
/// Cloning shares the same worker table.
#[derive(Debug, Clone, Default)]
pub struct LocalRuntime {
    config: LocalRuntimeConfig,
    state: Arc<Mutex<LocalState>>,
}

impl LocalRuntime {
    /// Create a runtime with the given behavior
    pub fn new(config: LocalRuntimeConfig) -> Self {
        Self {
            config,
            state: Arc::default(),
        }
    }

    /// Create a manual runtime
    pub fn manual() -> Self {
        Self::new(LocalRuntimeConfig::manual())
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Driving workers
    // ------------------------------------------------------------------------

    /// Report a worker as ready. Returns false if it does not exist.
    pub fn mark_ready(&self, name: &str) -> bool {
        let mut state = self.lock();
        let Some(worker) = state.workers.get_mut(name) else {
            return false;
        };
        worker.ready = true;
        for waiter in worker.ready_waiters.drain(..) {
            waiter.complete();
        }
        true
    }

    /// Report every live worker as ready
    pub fn mark_all_ready(&self) -> usize {
        let names = self.live_workers();
        names.iter().filter(|name| self.mark_ready(name)).count()
    }

    /// Fail a worker's startup
    pub fn fail_startup(&self, name: &str, reason: &str) -> bool {
        let mut state = self.lock();
        let Some(worker) = state.workers.get_mut(name) else {
            return false;
        };
        for waiter in worker.ready_waiters.drain(..) {
            waiter.fail(reason);
        }
        true
    }

    /// Finish a requested drain. Returns false if none is in progress.
    pub fn finish_drain(&self, name: &str) -> bool {
        let mut state = self.lock();
        let Some(worker) = state.workers.get_mut(name) else {
            return false;
        };
        if !worker.drain_requested {
            return false;
        }
        worker.drained = true;
        for waiter in worker.drain_waiters.drain(..) {
            waiter.complete();
        }
        true
    }

    /// Finish every requested drain
    pub fn finish_all_drains(&self) -> usize {
        let names = self.live_workers();
        names.iter().filter(|name| self.finish_drain(name)).count()
    }

    /// Remove a worker as if it had crashed
    pub fn kill(&self, name: &str) -> bool {
        self.lock().workers.remove(name).is_some()
    }

    /// Make the next `create` call fail
    pub fn fail_next_create(&self, reason: impl Into<String>) {
        self.lock().create_failure = Some(reason.into());
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Names of all workers ever created, in creation order
    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    /// Number of create calls that produced a worker
    pub fn creation_count(&self) -> usize {
        self.lock().created.len()
    }

    /// Names of workers a drain was requested for
    pub fn drain_requests(&self) -> Vec<String> {
        self.lock().drain_requests.clone()
    }

    /// Names of all terminated workers
    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    /// Names of workers terminated before their drain finished
    pub fn forced_terminations(&self) -> Vec<String> {
        self.lock().forced.clone()
    }

    /// Names of workers currently alive
    pub fn live_workers(&self) -> Vec<String> {
        self.lock().workers.keys().cloned().collect()
    }

    /// Whether a worker is alive
    pub fn is_alive(&self, name: &str) -> bool {
        self.lock().workers.contains_key(name)
    }

    /// Whether a worker has reported ready
    pub fn is_ready(&self, name: &str) -> bool {
        self.lock().workers.get(name).is_some_and(|w| w.ready)
    }

    /// Spec a live worker was created from
    pub fn worker_spec(&self, name: &str) -> Option<WorkerSpec> {
        self.lock().workers.get(name).map(|w| w.spec.clone())
    }

    fn readiness(&self, worker: &mut LocalWorker) -> Completion {
        if worker.ready {
            return Completion::done();
        }
        if !self.config.auto_ready {
            let (tx, completion) = Completion::channel();
            worker.ready_waiters.push(tx);
            return completion;
        }

        match (self.config.startup_delay, tokio::runtime::Handle::try_current()) {
            (Some(delay), Ok(handle)) => {
                let (tx, completion) = Completion::channel();
                worker.ready_waiters.push(tx);
                let runtime = self.clone();
                let name = worker.handle.name.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    runtime.mark_ready(&name);
                });
                completion
            }
            _ => {
                worker.ready = true;
                Completion::done()
            }
        }
    }
}

impl WorkerRuntime for LocalRuntime {
    fn lookup(&self, name: &str) -> Result<Option<WorkerHandle>, RuntimeError> {
        Ok(self.lock().workers.get(name).map(|w| w.handle.clone()))
    }

    fn create(&self, spec: WorkerSpec) -> Result<(WorkerHandle, Completion), RuntimeError> {
        let mut state = self.lock();
        if let Some(reason) = state.create_failure.take() {
            return Err(RuntimeError::Create {
                name: spec.name,
                reason,
            });
        }
        if state.workers.contains_key(&spec.name) {
            return Err(RuntimeError::Create {
                name: spec.name,
                reason: "a worker with this name already exists".to_string(),
            });
        }

        state.next_id += 1;
        let handle = WorkerHandle::new(spec.name.clone(), format!("local-{}", state.next_id));
        let mut worker = LocalWorker {
            handle: handle.clone(),
            spec,
            ready: false,
            drain_requested: false,
            drained: false,
            ready_waiters: Vec::new(),
            drain_waiters: Vec::new(),
        };
        let completion = self.readiness(&mut worker);

        tracing::debug!(worker = %handle, "Local worker created");
        state.created.push(handle.name.clone());
        state.workers.insert(handle.name.clone(), worker);
        Ok((handle, completion))
    }

    fn ready(&self, handle: &WorkerHandle) -> Result<Completion, RuntimeError> {
        let mut state = self.lock();
        match state.workers.get_mut(&handle.name) {
            Some(worker) => Ok(self.readiness(worker)),
            None => Err(RuntimeError::Startup {
                name: handle.name.clone(),
                reason: "worker no longer exists".to_string(),
            }),
        }
    }

    fn drain(&self, handle: &WorkerHandle) -> Result<Completion, RuntimeError> {
        let mut state = self.lock();
        state.drain_requests.push(handle.name.clone());
        let Some(worker) = state.workers.get_mut(&handle.name) else {
            return Ok(Completion::done());
        };

        worker.drain_requested = true;
        if worker.drained || self.config.auto_drain {
            worker.drained = true;
            return Ok(Completion::done());
        }
        let (tx, completion) = Completion::channel();
        worker.drain_waiters.push(tx);
        Ok(completion)
    }

    fn terminate(&self, handle: &WorkerHandle) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let Some(worker) = state.workers.remove(&handle.name) else {
            return Ok(());
        };
        if !worker.drained {
            state.forced.push(handle.name.clone());
        }
        state.terminated.push(handle.name.clone());
        tracing::debug!(worker = %handle, forced = !worker.drained, "Local worker terminated");
        Ok(())
    }
}
