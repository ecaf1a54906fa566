//! Election message types
//!
//! The coordinator receives membership changes and operator requests, then
//! forwards a self-contained candidate snapshot to the elector of each
//! affected segment.

use super::ElectionError;
use chrono::{DateTime, Utc};
use ironfleet_core::connection::Connection;
use ironfleet_core::ids::{ConnectionId, ControllerId, SegmentId};
use ironfleet_core::models::{ControllerRecord, ServiceAssignment, ServiceKind};
use ironfleet_core::protocol::ServingGrant;
use kameo::Reply;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Why an election pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    RackAvailable,
    RackLost,
    Override,
    OwnerStopped,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::RackAvailable => "rack_available",
            Trigger::RackLost => "rack_lost",
            Trigger::Override => "override",
            Trigger::OwnerStopped => "owner_stopped",
        }
    }
}

/// A connected rack as seen by one segment's elector.
#[derive(Debug, Clone)]
pub struct SegmentCandidate {
    pub rack: ControllerId,
    pub name: String,
    pub registered_at: DateTime<Utc>,
    pub services: BTreeSet<ServiceKind>,
    pub connection: Connection,
}

// Coordinator messages

/// A rack registered on a fresh connection.
#[derive(Debug, Clone)]
pub struct RackAvailable {
    pub record: ControllerRecord,
    pub connection: Connection,
}

/// A registered connection closed. Ignored unless it is still the rack's
/// current connection.
#[derive(Debug, Clone)]
pub struct RackLost {
    pub rack: ControllerId,
    pub connection: ConnectionId,
}

/// A rack reports it stopped serving on its own.
#[derive(Debug, Clone)]
pub struct OwnerStopped {
    pub rack: ControllerId,
    pub grant: ServingGrant,
}

/// Pin (or unpin, with `rack: None`) the owner of a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    pub segment: SegmentId,
    pub service: ServiceKind,
    #[serde(default)]
    pub rack: Option<ControllerId>,
}

/// Snapshot of every stored assignment.
#[derive(Debug, Clone)]
pub struct GetAssignments;

#[derive(Debug, Clone, Serialize, Deserialize, Reply)]
pub struct ElectionStatus {
    pub assignments: Vec<ServiceAssignment>,
    /// Election passes run per segment by this region process.
    pub passes: BTreeMap<SegmentId, u64>,
}

// Elector messages

/// Run one election pass over every service of the segment.
#[derive(Debug, Clone)]
pub struct Elect {
    pub trigger: Trigger,
    pub candidates: Vec<SegmentCandidate>,
}

/// Set or clear a pin, then run a pass.
#[derive(Debug, Clone)]
pub struct Pin {
    pub service: ServiceKind,
    pub rack: Option<ControllerId>,
    pub candidates: Vec<SegmentCandidate>,
}

/// Deliver `StartServing` again to a rack that demoted itself while still
/// being the recorded owner.
#[derive(Debug, Clone)]
pub struct Redeliver {
    pub rack: ControllerId,
    pub grant: ServingGrant,
}

/// Outcome of a `StartServing` delivery.
#[derive(Debug, Clone)]
pub struct Acknowledged {
    pub service: ServiceKind,
    pub owner: ControllerId,
    pub epoch: u64,
    pub accepted: bool,
    /// Epoch the rack holds; differs from `epoch` when it refused.
    pub held_epoch: u64,
}

#[derive(Debug, Clone)]
pub struct GetElectorStatus;

#[derive(Debug, Clone, Reply)]
pub struct ElectorStatus {
    pub segment: SegmentId,
    pub passes: u64,
}

pub type OverrideReply = Result<ServiceAssignment, ElectionError>;
