//! Prometheus metrics for the backend controller
//!
//! This module tracks replica counts per backend and state, goal and
//! checkpoint activity, capacity rejections, forced terminations and tick
//! durations.
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram, Counter,
    CounterVec, Encoder, GaugeVec, Histogram, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all controller metrics
struct ControllerMetrics {
    replicas: GaugeVec,
    goals_created: Counter,
    goals_completed: Counter,
    checkpoints_written: Counter,
    checkpoint_bytes: Counter,
    capacity_rejections: CounterVec,
    forced_terminations: Counter,
    tick_duration: Histogram,
}

/// Global storage for controller metrics
static CONTROLLER_METRICS: OnceLock<ControllerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = backend_controller::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = ControllerMetrics {
        replicas: register_gauge_vec!(
            "backend_controller_replicas",
            "Number of replicas by backend and state",
            &["backend", "state"]
        )?,
        goals_created: register_counter!(
            "backend_controller_goals_created_total",
            "Total goals handed out"
        )?,
        goals_completed: register_counter!(
            "backend_controller_goals_completed_total",
            "Total goals completed or superseded"
        )?,
        checkpoints_written: register_counter!(
            "backend_controller_checkpoints_written_total",
            "Total checkpoints written"
        )?,
        checkpoint_bytes: register_counter!(
            "backend_controller_checkpoint_bytes_total",
            "Total bytes of checkpoint data written"
        )?,
        capacity_rejections: register_counter_vec!(
            "backend_controller_capacity_rejections_total",
            "Scale-ups rejected by the admission check",
            &["backend"]
        )?,
        forced_terminations: register_counter!(
            "backend_controller_forced_terminations_total",
            "Replicas terminated without a completed drain"
        )?,
        tick_duration: register_histogram!(
            "backend_controller_tick_duration_seconds",
            "Duration of one reconciliation tick in seconds",
            vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
        )?,
    };

    CONTROLLER_METRICS.set(metrics).ok();
    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Check if metrics are initialized
pub fn metrics_initialized() -> bool {
    CONTROLLER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Set the replica count for a backend and state
pub fn set_replica_count(backend: &str, state: &str, count: usize) {
    if let Some(m) = CONTROLLER_METRICS.get() {
        m.replicas
            .with_label_values(&[backend, state])
            .set(count as f64);
    }
}

/// Drop the replica gauges of a garbage-collected backend
pub fn remove_backend(backend: &str, states: &[&str]) {
    let Some(m) = CONTROLLER_METRICS.get() else {
        return;
    };
    for state in states {
        let _ = m.replicas.remove_label_values(&[backend, *state]);
    }
}

/// Record a new goal
pub fn record_goal_created() {
    if let Some(m) = CONTROLLER_METRICS.get() {
        m.goals_created.inc();
    }
}

/// Record a completed goal
pub fn record_goal_completed() {
    if let Some(m) = CONTROLLER_METRICS.get() {
        m.goals_completed.inc();
    }
}

/// Record a checkpoint write
pub fn record_checkpoint_written(bytes: usize) {
    let Some(m) = CONTROLLER_METRICS.get() else {
        return;
    };

    m.checkpoints_written.inc();
    m.checkpoint_bytes.inc_by(bytes as f64);
}

/// Record a rejected scale-up
pub fn record_capacity_rejection(backend: &str) {
    if let Some(m) = CONTROLLER_METRICS.get() {
        m.capacity_rejections.with_label_values(&[backend]).inc();
    }
}

/// Record a replica terminated without a completed drain
pub fn record_forced_termination() {
    if let Some(m) = CONTROLLER_METRICS.get() {
        m.forced_terminations.inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a tick timer
pub fn start_tick_timer() -> MetricsTimer {
    match CONTROLLER_METRICS.get() {
        Some(m) => MetricsTimer::new(m.tick_duration.start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
