//! Metrics instrumentation for runtime observability.
//!
//! All functions record through the `metrics` facade and are no-ops until a
//! recorder is installed (see `install_prometheus` behind the `prometheus`
//! feature).

use std::time::Instant;

pub const MODEL_LATENCY: &str = "model_request_latency";
pub const TOOL_LATENCY: &str = "tool_execution_latency";
pub const TURN_DURATION: &str = "turn_duration";

/// Record model request latency.
pub fn record_model_latency(duration_ms: f64) {
    metrics::histogram!(MODEL_LATENCY, duration_ms);
}

/// Record tool execution latency.
pub fn record_tool_latency(duration_ms: f64) {
    metrics::histogram!(TOOL_LATENCY, duration_ms);
}

/// Record the duration of a whole turn, gate to response.
pub fn record_turn_duration(duration_ms: f64) {
    metrics::histogram!(TURN_DURATION, duration_ms);
}

/// Increment compaction counter.
pub fn increment_compaction_count() {
    metrics::counter!("compaction_count", 1);
}

/// Increment the counter of requests refused by the session gate.
pub fn increment_gate_contention() {
    metrics::counter!("session_gate_contention", 1);
}

/// Add progress events the stream relay discarded.
pub fn record_relay_drops(dropped: usize) {
    metrics::counter!("stream_relay_dropped_events", dropped as u64);
}

/// RAII timer for automatic metric recording.
pub struct MetricTimer {
    start: Instant,
    metric_name: &'static str,
}

impl MetricTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration_ms = self.elapsed_ms();
        match self.metric_name {
            MODEL_LATENCY => record_model_latency(duration_ms),
            TOOL_LATENCY => record_tool_latency(duration_ms),
            TURN_DURATION => record_turn_duration(duration_ms),
            _ => {}
        }
    }
}

/// Install the Prometheus recorder and return its render handle.
#[cfg(feature = "prometheus")]
pub fn install_prometheus(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, crate::interfaces::RuntimeError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| {
            crate::interfaces::RuntimeError::ConfigError(format!(
                "Failed to install Prometheus recorder: {}",
                e
            ))
        })
}
