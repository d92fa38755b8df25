// Prometheus collectors for the judging engine.
//
// Registered once in the default registry; callers expose `gather()` on
// whatever endpoint they already serve.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref JUDGEMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "arbiter_judgements_total",
        "Completed judging runs by verdict and language",
        &["verdict", "language"]
    )
    .expect("register arbiter_judgements_total");
    pub static ref JUDGE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "arbiter_judge_duration_seconds",
        "Wall-clock duration of a judging run",
        &["language"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("register arbiter_judge_duration_seconds");
    pub static ref ACTIVE_WORKSPACES: IntGauge = register_int_gauge!(
        "arbiter_active_workspaces",
        "Workspaces currently allocated"
    )
    .expect("register arbiter_active_workspaces");
    pub static ref KILLED_PROCESS_GROUPS: IntCounterVec = register_int_counter_vec!(
        "arbiter_killed_process_groups_total",
        "Process groups force-killed before exiting on their own",
        &["reason"]
    )
    .expect("register arbiter_killed_process_groups_total");
    pub static ref WORKSPACE_CLEANUP_FAILURES: IntCounter = register_int_counter!(
        "arbiter_workspace_cleanup_failures_total",
        "Workspaces that could not be fully removed"
    )
    .expect("register arbiter_workspace_cleanup_failures_total");
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
