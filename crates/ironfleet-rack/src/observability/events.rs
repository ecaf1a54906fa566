//! Structured rack events
//!
//! Event types:
//! - `region_connect_failed` - one establishment attempt failed
//! - `region_address_refused` - identity refused; address parked until restart
//! - `service_started` - began serving a (segment, service) grant
//! - `service_stopped` - stopped serving, on instruction or self-demotion
//! - `power_state_observed` - power state differs from the last observation

use ironfleet_core::ids::{ControllerId, MachineId, SegmentId};
use ironfleet_core::models::{PowerState, ServiceKind};
use std::time::Duration;
use tracing::{error, info, warn};

pub fn region_connect_failed(address: &str, error: &str, retry_in: Duration) {
    warn!(
        event_type = "region_connect_failed",
        address = %address,
        error = %error,
        retry_in_ms = retry_in.as_millis() as u64,
        "Region connection attempt failed"
    );
}

pub fn region_address_refused(address: &str, reason: &str) {
    error!(
        event_type = "region_address_refused",
        address = %address,
        reason = %reason,
        "Region refused our identity; not retrying this address"
    );
}

pub fn service_started(segment: &SegmentId, service: ServiceKind, epoch: u64, region: &ControllerId) {
    info!(
        event_type = "service_started",
        segment_id = %segment,
        service = %service,
        epoch = epoch,
        region_id = %region,
        "Started serving"
    );
}

pub fn service_stopped(segment: &SegmentId, service: ServiceKind, epoch: u64, reason: &str) {
    info!(
        event_type = "service_stopped",
        segment_id = %segment,
        service = %service,
        epoch = epoch,
        reason = %reason,
        "Stopped serving"
    );
}

pub fn power_state_observed(machine: &MachineId, previous: PowerState, current: PowerState) {
    info!(
        event_type = "power_state_observed",
        machine_id = %machine,
        previous_state = %previous,
        new_state = %current,
        "Power state changed"
    );
}
