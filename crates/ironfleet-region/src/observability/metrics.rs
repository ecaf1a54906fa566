//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `ironfleet_racks_connected` - gauge of registered rack connections
//! - `ironfleet_elections_total` - counter of election passes by trigger
//! - `ironfleet_owner_changes_total` - counter of ownership changes
//! - `ironfleet_assignment_epoch` - gauge of the current epoch per (segment, service)
//! - `ironfleet_steps_total` - counter of finished steps by kind and outcome
//! - `ironfleet_step_attempt_duration_seconds` - histogram of step attempt durations
//! - `ironfleet_machines_by_state` - gauge of machines by lifecycle state
//!
//! Connection and call metrics come from `ironfleet_core::observability::metrics`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Holds the Prometheus handle for `/metrics`.
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

pub fn init_metrics() -> Result<MetricsState, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metric_descriptions();
    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    ironfleet_core::observability::metrics::describe_connection_metrics();

    describe_gauge!(
        "ironfleet_racks_connected",
        "Number of rack controllers registered with this region"
    );
    describe_counter!(
        "ironfleet_elections_total",
        "Total number of election passes"
    );
    describe_counter!(
        "ironfleet_owner_changes_total",
        "Total number of service ownership changes"
    );
    describe_gauge!(
        "ironfleet_assignment_epoch",
        "Current epoch of each service assignment"
    );
    describe_counter!("ironfleet_steps_total", "Total number of finished lifecycle steps");
    describe_histogram!(
        "ironfleet_step_attempt_duration_seconds",
        "Duration of lifecycle step attempts in seconds"
    );
    describe_gauge!(
        "ironfleet_machines_by_state",
        "Number of machines by lifecycle state"
    );
}

pub fn set_racks_connected(count: usize) {
    gauge!("ironfleet_racks_connected").set(count as f64);
}

pub fn record_election(trigger: &'static str) {
    counter!("ironfleet_elections_total", "trigger" => trigger).increment(1);
}

pub fn record_owner_change(segment: &str, service: &str, epoch: u64) {
    counter!("ironfleet_owner_changes_total", "service" => service.to_string()).increment(1);
    gauge!(
        "ironfleet_assignment_epoch",
        "segment" => segment.to_string(),
        "service" => service.to_string()
    )
    .set(epoch as f64);
}

pub fn record_step(kind: &'static str, outcome: &'static str) {
    counter!("ironfleet_steps_total", "kind" => kind, "outcome" => outcome).increment(1);
}

pub fn record_step_attempt(kind: &'static str, duration: Duration) {
    histogram!("ironfleet_step_attempt_duration_seconds", "kind" => kind)
        .record(duration.as_secs_f64());
}

/// Move one machine between state gauges (`from: None` for a new machine).
pub fn machine_state_moved(from: Option<&str>, to: &str) {
    if let Some(from) = from {
        gauge!("ironfleet_machines_by_state", "state" => from.to_string()).decrement(1.0);
    }
    gauge!("ironfleet_machines_by_state", "state" => to.to_string()).increment(1.0);
}
