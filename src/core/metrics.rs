// src/core/metrics.rs

//! Defines and registers Prometheus metrics for cluster-manager monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire process lifetime.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Gauge, GaugeVec, Histogram, HistogramVec, TextEncoder, register_counter_vec,
    register_gauge, register_gauge_vec, register_histogram, register_histogram_vec,
};

lazy_static! {
    // --- Job queue ---
    /// Total opcodes run, labeled by opcode name and final status
    /// (success/error/cancelled).
    pub static ref JOBS_TOTAL: CounterVec = register_counter_vec!(
        "ganeti_jobs_total",
        "Total number of opcodes run, labeled by opcode and final status.",
        &["opcode", "status"]
    )
    .unwrap();
    /// Number of jobs currently in the Running state.
    pub static ref JOBS_RUNNING: Gauge =
        register_gauge!("ganeti_jobs_running", "Number of jobs currently running.").unwrap();

    // --- Lock manager ---
    /// Time spent waiting to acquire a lock, labeled by level
    /// (cluster/instance/node) and mode (shared/exclusive).
    pub static ref LOCK_WAIT_SECONDS: HistogramVec = register_histogram_vec!(
        "ganeti_lock_wait_seconds",
        "Time spent waiting to acquire a lock, by level and mode.",
        &["level", "mode"]
    )
    .unwrap();

    // --- Block devices ---
    /// Current DRBD resync percentage per instance/disk index, only
    /// meaningful while that disk is actively resyncing.
    pub static ref DRBD_SYNC_PERCENT: GaugeVec = register_gauge_vec!(
        "ganeti_drbd_sync_percent",
        "Current DRBD resync percentage, by instance and disk index.",
        &["instance", "disk"]
    )
    .unwrap();

    // --- RPC transport ---
    /// Latency of one RPC fan-out call (all targeted nodes), labeled by
    /// procedure name.
    pub static ref RPC_CALL_SECONDS: HistogramVec = register_histogram_vec!(
        "ganeti_rpc_call_seconds",
        "Latency of an RPC fan-out call, by procedure.",
        &["procedure"]
    )
    .unwrap();
    /// Total RPC calls made to nodes, labeled by procedure and outcome
    /// (ok/failed/offline).
    pub static ref RPC_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "ganeti_rpc_calls_total",
        "Total RPC calls made to nodes, by procedure and outcome.",
        &["procedure", "outcome"]
    )
    .unwrap();

    // --- Hooks runner ---
    /// Time spent running one hook phase's scripts to completion.
    pub static ref HOOKS_PHASE_SECONDS: Histogram = register_histogram!(
        "ganeti_hooks_phase_seconds",
        "Time spent running one hook phase (pre or post) to completion."
    )
    .unwrap();
}

/// Records the final outcome of one opcode's run.
pub fn record_job_outcome(opcode: &str, status: &str) {
    JOBS_TOTAL.with_label_values(&[opcode, status]).inc();
}

/// Records a lock wait's duration for the lock-wait histogram.
pub fn record_lock_wait(level: &str, mode: &str, elapsed: std::time::Duration) {
    LOCK_WAIT_SECONDS
        .with_label_values(&[level, mode])
        .observe(elapsed.as_secs_f64());
}

/// Records one RPC fan-out call's wall-clock latency and per-node outcomes.
pub fn record_rpc_call(procedure: &str, elapsed: std::time::Duration, outcomes: &[&str]) {
    RPC_CALL_SECONDS
        .with_label_values(&[procedure])
        .observe(elapsed.as_secs_f64());
    for outcome in outcomes {
        RPC_CALLS_TOTAL.with_label_values(&[procedure, outcome]).inc();
    }
}

/// Sets (or clears, passing `None`) the resync gauge for one instance/disk.
pub fn set_drbd_sync_percent(instance: &str, disk: &str, percent: Option<f64>) {
    DRBD_SYNC_PERCENT
        .with_label_values(&[instance, disk])
        .set(percent.unwrap_or(0.0));
}

/// Gathers all registered metrics and encodes them in the Prometheus text
/// format, for the `/metrics` HTTP handler.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_job_outcome_increments_labeled_counter() {
        record_job_outcome("OpStartInstance", "success");
        let value = JOBS_TOTAL.with_label_values(&["OpStartInstance", "success"]).get();
        assert!(value >= 1.0);
    }

    #[test]
    fn gather_metrics_includes_registered_families() {
        record_job_outcome("OpVerifyCluster", "success");
        let text = gather_metrics();
        assert!(text.contains("ganeti_jobs_total"));
    }
}
