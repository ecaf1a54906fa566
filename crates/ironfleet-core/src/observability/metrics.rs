//! Connection metrics
//!
//! Metrics tracked:
//! - `ironfleet_connections` - gauge of open connections by local side
//! - `ironfleet_connections_closed_total` - counter of closed connections
//! - `ironfleet_calls_total` - counter of outbound calls by op and outcome
//! - `ironfleet_call_duration_seconds` - histogram of call round-trips
//!
//! Each binary installs the Prometheus recorder itself and calls
//! [`describe_connection_metrics`] alongside its own descriptions.

use crate::error::CallError;
use crate::models::ControllerKind;
use crate::protocol::Reply;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

pub fn describe_connection_metrics() {
    describe_gauge!(
        "ironfleet_connections",
        "Number of open rack/region connections"
    );
    describe_counter!(
        "ironfleet_connections_closed_total",
        "Total number of connections closed"
    );
    describe_counter!(
        "ironfleet_calls_total",
        "Total number of outbound calls by operation and outcome"
    );
    describe_histogram!(
        "ironfleet_call_duration_seconds",
        "Duration of outbound calls in seconds"
    );
}

pub fn record_connection_opened(side: ControllerKind) {
    gauge!("ironfleet_connections", "side" => side.to_string()).increment(1.0);
}

pub fn record_connection_closed(side: ControllerKind) {
    gauge!("ironfleet_connections", "side" => side.to_string()).decrement(1.0);
    counter!("ironfleet_connections_closed_total", "side" => side.to_string()).increment(1);
}

pub fn record_call(op: &'static str, result: &Result<Reply, CallError>, elapsed: Duration) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(CallError::Timeout { .. }) => "timeout",
        Err(CallError::Remote(_)) => "remote_error",
        Err(_) => "transport_error",
    };
    counter!("ironfleet_calls_total", "op" => op, "outcome" => outcome).increment(1);
    histogram!("ironfleet_call_duration_seconds", "op" => op).record(elapsed.as_secs_f64());
}
