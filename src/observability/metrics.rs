//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define engine metrics (requests, latency, in-flight, overloads)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `switchyard_requests_total` (counter): requests by method, status
//! - `switchyard_request_duration_seconds` (histogram): latency distribution
//! - `switchyard_requests_in_flight` (gauge): tracked requests
//! - `switchyard_resolution_failures_total` (counter): by failure kind
//! - `switchyard_worker_overloads_total` (counter): refused pool jobs
//! - `switchyard_connections_rejected_total` (counter): requests turned away
//!   at the connection cap
//! - `switchyard_compression_total` (counter): gzip outcomes
//! - `switchyard_connections_active` (gauge): open transport connections
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    counter!("switchyard_requests_total", &labels).increment(1);
    histogram!("switchyard_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

pub fn set_in_flight(count: usize) {
    gauge!("switchyard_requests_in_flight").set(count as f64);
}

pub fn record_resolution_failure(kind: &str) {
    counter!("switchyard_resolution_failures_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_overload() {
    counter!("switchyard_worker_overloads_total").increment(1);
}

pub fn record_connection_rejected() {
    counter!("switchyard_connections_rejected_total").increment(1);
}

pub fn record_compression(outcome: &str) {
    counter!("switchyard_compression_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!("switchyard_connections_active").set(count as f64);
}
