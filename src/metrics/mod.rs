//! Metrics collection and export
//!
//! Thin wrappers over the `metrics` macros so call sites stay one line. Without
//! an installed recorder every call is a no-op, which keeps tests silent.

use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;

use crate::error::{AppError, Result};

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the global Prometheus recorder. Safe to call more than once.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PROMETHEUS
        .get_or_try_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| AppError::internal(format!("Failed to install metrics recorder: {e}")))
        })
        .cloned()
}

pub fn record_key_selected(fingerprint: &str) {
    counter!("gemini_key_pool_key_selections_total", "key" => fingerprint.to_string()).increment(1);
}

pub fn record_key_failure(fingerprint: &str, reason: &str) {
    counter!(
        "gemini_key_pool_key_failures_total",
        "key" => fingerprint.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_keys_exhausted() {
    counter!("gemini_key_pool_exhausted_total").increment(1);
}

pub fn record_pool_availability(total: usize, available: usize) {
    gauge!("gemini_key_pool_keys_total").set(total as f64);
    gauge!("gemini_key_pool_keys_available").set(available as f64);
}

/// Outcome of one `generate()` call: `success`, `fatal`, `exhausted_retries`,
/// `keys_exhausted` or `store_error`.
pub fn record_generation(service: &str, outcome: &'static str, duration: Duration) {
    counter!(
        "gemini_key_pool_generations_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("gemini_key_pool_generation_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
}

pub fn record_retry(kind: &'static str) {
    counter!("gemini_key_pool_retries_total", "kind" => kind).increment(1);
}

/// `GET /metrics` in Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed\n".to_string(),
        ),
    }
}
