//! Observability setup: structured logging and metrics.

use std::time::Instant;

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kestrel=debug"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Install a Prometheus metrics exporter listening on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

// ---------------------------------------------------------------------------
// Operation metrics
// ---------------------------------------------------------------------------

/// Record the outcome and latency of one executed operation.
pub fn record_op(op: &'static str, started: Instant, success: bool) {
    let name = if success {
        "kestrel_op_success_total"
    } else {
        "kestrel_op_failure_total"
    };
    metrics::counter!(name, "op" => op).increment(1);
    metrics::histogram!("kestrel_op_latency_us", "op" => op)
        .record(started.elapsed().as_micros() as f64);
}

// ---------------------------------------------------------------------------
// Connection pool metrics
// ---------------------------------------------------------------------------

/// Why a pooled connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed after an error left the stream in an unknown state.
    Error,
    /// Reaped after exceeding the idle age.
    Idle,
    /// Fenced out by a pool session change.
    Session,
}

impl CloseReason {
    fn label(self) -> &'static str {
        match self {
            CloseReason::Error => "error",
            CloseReason::Idle => "idle",
            CloseReason::Session => "session",
        }
    }
}

pub fn record_connection_created() {
    metrics::counter!("kestrel_connections_created_total").increment(1);
}

pub fn record_connection_closed(reason: CloseReason) {
    metrics::counter!("kestrel_connections_closed_total", "reason" => reason.label())
        .increment(1);
}

/// Current number of inactive connections in one pool.
pub fn record_idle_connections(count: usize) {
    metrics::gauge!("kestrel_connections_idle").set(count as f64);
}

/// Current number of concurrent connection attempts in one pool.
pub fn record_connection_attempts(count: usize) {
    metrics::gauge!("kestrel_connection_attempts").set(count as f64);
}

// ---------------------------------------------------------------------------
// Route manager metrics
// ---------------------------------------------------------------------------

/// A route was added back to the active set.
pub fn record_route_added() {
    metrics::counter!("kestrel_routes_added_total").increment(1);
}

/// A route was removed from the active set due to problems.
pub fn record_route_removed() {
    metrics::counter!("kestrel_routes_removed_total").increment(1);
}

/// The route manager entered the fail-open state.
pub fn record_fail_open_event() {
    metrics::counter!("kestrel_fail_open_events_total").increment(1);
}
