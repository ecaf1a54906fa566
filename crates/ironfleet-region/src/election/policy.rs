//! Owner selection for one (segment, service) pair.

use chrono::{DateTime, Utc};
use ironfleet_core::ids::ControllerId;

/// A connected rack advertising the service for the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub rack: ControllerId,
    /// First time the rack advertised the segment.
    pub registered_at: DateTime<Utc>,
}

/// Pick the owner among `candidates`.
///
/// Order of preference:
/// 1. the administratively pinned rack, if it is a candidate
/// 2. the incumbent, if it is still a candidate
/// 3. the earliest registration for the segment
/// 4. the lowest controller id
///
/// Returns `None` when there are no candidates.
pub fn choose_owner(
    incumbent: Option<ControllerId>,
    pinned: Option<ControllerId>,
    candidates: &[Candidate],
) -> Option<ControllerId> {
    let is_candidate = |rack: ControllerId| candidates.iter().any(|c| c.rack == rack);

    if let Some(rack) = pinned.filter(|r| is_candidate(*r)) {
        return Some(rack);
    }
    if let Some(rack) = incumbent.filter(|r| is_candidate(*r)) {
        return Some(rack);
    }
    candidates
        .iter()
        .min_by_key(|c| (c.registered_at, c.rack))
        .map(|c| c.rack)
}
