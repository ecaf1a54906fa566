//! Service Election
//!
//! Chooses exactly one connected, capable rack per (segment, service) and
//! keeps that choice stable unless forced to change.
//!
//! ## Architecture
//!
//! ```text
//! RegionSession ──RackAvailable/RackLost──▶ ElectionCoordinator
//!                                               │ Elect (one per segment)
//!                                               ▼
//!                                         SegmentElector ──CAS──▶ Store
//!                                               │ StartServing / StopServing
//!                                               ▼
//!                                         rack connection
//! ```
//!
//! Every ownership change bumps the pair's epoch through a compare-and-swap
//! on the stored assignment. Acknowledgements and reports carrying an older
//! epoch are dropped.

mod coordinator;
mod elector;
pub mod messages;
pub mod policy;

pub use coordinator::ElectionCoordinator;
pub use elector::SegmentElector;
pub use messages::{
    ElectionStatus, GetAssignments, Override, OwnerStopped, RackAvailable, RackLost, Trigger,
};

use crate::store::StoreError;
use ironfleet_core::error::{Classify, ErrorClass};
use ironfleet_core::ids::{ControllerId, SegmentId};
use ironfleet_core::models::ServiceKind;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("rack {rack} is not a connected candidate for {service} on segment {segment}")]
    NotCandidate {
        rack: ControllerId,
        segment: SegmentId,
        service: ServiceKind,
    },
    #[error("assignment for {service} on segment {segment} kept changing concurrently")]
    Contention {
        segment: SegmentId,
        service: ServiceKind,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("election unavailable: {0}")]
    Unavailable(String),
}

impl Classify for ElectionError {
    fn class(&self) -> ErrorClass {
        match self {
            ElectionError::NotCandidate { .. } => ErrorClass::CapabilityPermanent,
            ElectionError::Contention { .. } => ErrorClass::Coordination,
            ElectionError::Store(e) => e.class(),
            ElectionError::Unavailable(_) => ErrorClass::TransientTransport,
        }
    }
}

/// Election tunables.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Reload-and-retry bound for a pass that loses a CAS race.
    pub cas_attempts: u32,
    /// Deadline of each `StartServing` / `StopServing` call.
    pub notify_timeout: Duration,
    pub notify_backoff_initial: Duration,
    pub notify_backoff_max: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            cas_attempts: 5,
            notify_timeout: Duration::from_secs(5),
            notify_backoff_initial: Duration::from_millis(200),
            notify_backoff_max: Duration::from_secs(10),
        }
    }
}
