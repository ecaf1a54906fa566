//! Connection events
//!
//! Event types:
//! - `connection_established` - identity negotiated, tasks running
//! - `connection_closed` - terminal close with reason
//! - `identity_rejected` - handshake refused; needs an operator

use crate::ids::{ConnectionId, ControllerId};
use crate::models::ControllerKind;
use tracing::{error, info, warn};

pub fn connection_established(
    connection_id: &ConnectionId,
    peer_id: &ControllerId,
    peer_name: &str,
    peer_kind: ControllerKind,
) {
    info!(
        event_type = "connection_established",
        connection_id = %connection_id,
        peer_id = %peer_id,
        peer_name = %peer_name,
        peer_kind = %peer_kind,
        "Connection established"
    );
}

pub fn connection_closed(
    connection_id: &ConnectionId,
    peer_id: &ControllerId,
    peer_name: &str,
    reason: &str,
) {
    warn!(
        event_type = "connection_closed",
        connection_id = %connection_id,
        peer_id = %peer_id,
        peer_name = %peer_name,
        reason = %reason,
        "Connection closed"
    );
}

/// Emitted by whichever side refused or was refused.
pub fn identity_rejected(peer: &str, address: &str, reason: &str) {
    error!(
        event_type = "identity_rejected",
        peer = %peer,
        address = %address,
        reason = %reason,
        "Controller identity rejected"
    );
}
