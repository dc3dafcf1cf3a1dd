//! Prometheus metrics for the evaluation service.
//!
//! Exposed via GET /metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Encoder, Histogram,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Steps by outcome: `ok`, an error kind, `usage_error` or `engine_error`.
    pub static ref STEPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "perfenv_steps_total",
        "Total number of step requests by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Wall-clock duration of a step request, including queueing on the session lock.
    pub static ref STEP_DURATION: Histogram = register_histogram!(
        "perfenv_step_duration_seconds",
        "Step request duration in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]
    )
    .unwrap();

    pub static ref REWARD: Histogram = register_histogram!(
        "perfenv_reward",
        "Distribution of step rewards",
        vec![-10.0, -5.0, -1.0, 0.0, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 1.0]
    )
    .unwrap();

    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "perfenv_active_sessions",
        "Number of live evaluator sessions"
    )
    .unwrap();
}

/// Render the default registry in Prometheus text format.
pub fn render_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
