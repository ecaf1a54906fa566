//! Rack metrics
//!
//! Metrics tracked:
//! - `ironfleet_driver_retries_total` - counter of retried driver calls by op and error kind
//! - `ironfleet_reconnect_attempts_total` - counter of region connection attempts by outcome
//! - `ironfleet_served_services` - gauge of (segment, service) grants being served
//! - `ironfleet_script_runs_total` - counter of script set runs by outcome
//!
//! Connection and call metrics come from `ironfleet_core::observability::metrics`.

use crate::capability::DriverErrorKind;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(listen: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;
    register_metric_descriptions();
    Ok(())
}

fn register_metric_descriptions() {
    ironfleet_core::observability::metrics::describe_connection_metrics();

    describe_counter!(
        "ironfleet_driver_retries_total",
        "Total number of retried power/script driver calls"
    );
    describe_counter!(
        "ironfleet_reconnect_attempts_total",
        "Total number of region connection attempts"
    );
    describe_gauge!(
        "ironfleet_served_services",
        "Number of (segment, service) grants currently served"
    );
    describe_counter!(
        "ironfleet_script_runs_total",
        "Total number of script set runs"
    );
}

pub fn record_driver_retry(op: &'static str, kind: DriverErrorKind) {
    counter!("ironfleet_driver_retries_total", "op" => op, "kind" => kind.to_string()).increment(1);
}

pub fn record_reconnect_attempt(outcome: &'static str) {
    counter!("ironfleet_reconnect_attempts_total", "outcome" => outcome).increment(1);
}

pub fn set_served_services(count: usize) {
    gauge!("ironfleet_served_services").set(count as f64);
}

pub fn record_script_run(outcome: &'static str) {
    counter!("ironfleet_script_runs_total", "outcome" => outcome).increment(1);
}
