//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status, backend
//! - `proxy_request_duration_seconds` (histogram): time to response head
//! - `proxy_upstream_failures_total` (counter): failed attempts by kind
//! - `proxy_body_bytes_total` (counter): body bytes by direction
//! - `proxy_framing_violations_total` (counter): framing violations by kind
//! - `proxy_temp_file_bytes_total` (counter): bytes spilled to temp files
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::gateway::FailureKind;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must run inside the Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, backend: &str, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "backend" => backend.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_failure(kind: FailureKind) {
    counter!("proxy_upstream_failures_total", "kind" => kind.to_string()).increment(1);
}

/// `direction` is `client_to_upstream` or `upstream_to_client`.
pub fn record_body_bytes(direction: &str, bytes: usize) {
    counter!("proxy_body_bytes_total", "direction" => direction.to_string()).increment(bytes as u64);
}

pub fn record_framing_violation(kind: &'static str) {
    counter!("proxy_framing_violations_total", "kind" => kind).increment(1);
}

pub fn record_temp_file_bytes(bytes: u64) {
    counter!("proxy_temp_file_bytes_total").increment(bytes);
}
