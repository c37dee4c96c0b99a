use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref ALERTS_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oka_alerts_received_total",
        "Alerts handed to the supervisor, by source.",
        &["source"]
    )
    .unwrap();
    pub static ref SESSIONS_STARTED_TOTAL: IntCounter = register_int_counter!(
        "oka_sessions_started_total",
        "Investigation sessions started."
    )
    .unwrap();
    pub static ref SESSIONS_FINISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oka_sessions_finished_total",
        "Investigation sessions finished, by outcome.",
        &["outcome"]
    )
    .unwrap();
    pub static ref SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        "oka_sessions_active",
        "Investigation sessions currently running."
    )
    .unwrap();
    pub static ref MODEL_CALLS_TOTAL: IntCounter =
        register_int_counter!("oka_model_calls_total", "Model generation requests.").unwrap();
    pub static ref TOOL_CALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oka_tool_calls_total",
        "Tool invocations, by status.",
        &["status"]
    )
    .unwrap();
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
