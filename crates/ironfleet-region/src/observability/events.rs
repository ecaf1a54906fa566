//! Structured Events
//!
//! Event types:
//! - `rack_registered` - rack connection accepted and registered
//! - `rack_unregistered` - rack connection closed and removed
//! - `owner_elected` - (segment, service) owner changed, new epoch
//! - `owner_confirmed` - owner acknowledged the current epoch
//! - `stale_claim_discarded` - a grant or acknowledgement with an old epoch was dropped
//! - `machine_state_changed` - lifecycle state transition
//! - `transition_accepted` - lifecycle command accepted
//! - `transition_finished` - lifecycle command reached a final state
//! - `step_started` - step attempt dispatched to a rack
//! - `step_finished` - step ended with its final outcome
//! - `store_write_failed` - a record could not be persisted

use tracing::{error, info, warn};

pub fn rack_registered(rack_id: &str, rack_name: &str, connection_id: &str, segments: usize) {
    info!(
        event_type = "rack_registered",
        rack_id = %rack_id,
        rack_name = %rack_name,
        connection_id = %connection_id,
        segments = segments,
        "Rack registered"
    );
}

pub fn rack_unregistered(rack_id: &str, connection_id: &str) {
    warn!(
        event_type = "rack_unregistered",
        rack_id = %rack_id,
        connection_id = %connection_id,
        "Rack unregistered"
    );
}

pub fn owner_elected(
    segment_id: &str,
    service: &str,
    previous_owner: Option<&str>,
    new_owner: Option<&str>,
    epoch: u64,
    trigger: &str,
) {
    info!(
        event_type = "owner_elected",
        segment_id = %segment_id,
        service = %service,
        previous_owner = previous_owner.unwrap_or("none"),
        new_owner = new_owner.unwrap_or("none"),
        epoch = epoch,
        trigger = %trigger,
        "Service owner elected"
    );
}

pub fn owner_confirmed(segment_id: &str, service: &str, owner: &str, epoch: u64) {
    info!(
        event_type = "owner_confirmed",
        segment_id = %segment_id,
        service = %service,
        owner = %owner,
        epoch = epoch,
        "Service owner confirmed"
    );
}

pub fn stale_claim_discarded(segment_id: &str, service: &str, claimed_epoch: u64, current_epoch: u64, source: &str) {
    info!(
        event_type = "stale_claim_discarded",
        segment_id = %segment_id,
        service = %service,
        claimed_epoch = claimed_epoch,
        current_epoch = current_epoch,
        source = %source,
        "Discarded stale ownership claim"
    );
}

pub fn machine_state_changed(machine_id: &str, previous_state: &str, new_state: &str, transition_id: &str) {
    info!(
        event_type = "machine_state_changed",
        machine_id = %machine_id,
        previous_state = %previous_state,
        new_state = %new_state,
        transition_id = %transition_id,
        "Machine state changed"
    );
}

pub fn transition_accepted(machine_id: &str, transition_id: &str, command: &str, from_state: &str) {
    info!(
        event_type = "transition_accepted",
        machine_id = %machine_id,
        transition_id = %transition_id,
        command = %command,
        from_state = %from_state,
        "Lifecycle command accepted"
    );
}

pub fn transition_finished(machine_id: &str, transition_id: &str, outcome: &str, final_state: &str) {
    info!(
        event_type = "transition_finished",
        machine_id = %machine_id,
        transition_id = %transition_id,
        outcome = %outcome,
        final_state = %final_state,
        "Lifecycle command finished"
    );
}

pub fn step_started(machine_id: &str, step_id: &str, kind: &str, attempt: u32, rack_id: &str) {
    info!(
        event_type = "step_started",
        machine_id = %machine_id,
        step_id = %step_id,
        kind = %kind,
        attempt = attempt,
        rack_id = %rack_id,
        "Step attempt started"
    );
}

pub fn step_finished(machine_id: &str, step_id: &str, kind: &str, outcome: &str, attempts: usize) {
    info!(
        event_type = "step_finished",
        machine_id = %machine_id,
        step_id = %step_id,
        kind = %kind,
        outcome = %outcome,
        attempts = attempts,
        "Step finished"
    );
}

pub fn store_write_failed(record: &str, key: &str, error: &str) {
    error!(
        event_type = "store_write_failed",
        record = %record,
        key = %key,
        error = %error,
        "Failed to persist record"
    );
}
