//! Error taxonomy
//!
//! Every failure in the control plane resolves to one [`ErrorClass`], which
//! decides whether it is retried silently, surfaced as a failed step, dropped
//! as stale, or escalated as a connection fault.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;

/// Classification shared by every layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Network blip or deadline expiry. Retried at the connection/wrapper layer.
    TransientTransport,
    /// BMC busy, power supply settling. Retried with backoff by the power wrapper.
    TransientHardware,
    /// Bad credentials, unsupported operation, failing scripts. Never retried.
    CapabilityPermanent,
    /// Stale epoch or duplicate ownership claim. Discarded locally.
    Coordination,
    /// Unknown or revoked controller at handshake. Needs an operator.
    FatalIdentity,
}

impl ErrorClass {
    /// Whether an automatic retry can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientTransport | ErrorClass::TransientHardware
        )
    }
}

/// Anything that can be placed in the taxonomy.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Error carried back over the wire in a `Response` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{class}: {message}")]
pub struct RemoteError {
    pub class: ErrorClass,
    pub message: String,
}

impl RemoteError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn unsupported(what: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorClass::CapabilityPermanent,
            format!("unsupported request: {what}"),
        )
    }
}

impl Classify for RemoteError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

/// Failure of a single call over a connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call {seq} timed out after {after:?}")]
    Timeout { seq: u64, after: Duration },
    #[error("connection closed")]
    Closed,
    #[error("connection is draining")]
    Draining,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no established connection available")]
    NoConnection,
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl Classify for CallError {
    fn class(&self) -> ErrorClass {
        match self {
            CallError::Timeout { .. }
            | CallError::Closed
            | CallError::Draining
            | CallError::Transport(_)
            | CallError::NoConnection => ErrorClass::TransientTransport,
            CallError::UnexpectedReply(_) => ErrorClass::CapabilityPermanent,
            CallError::Remote(e) => e.class,
        }
    }
}

impl CallError {
    /// Whether another connection may succeed where this one failed.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            CallError::Timeout { .. }
                | CallError::Closed
                | CallError::Draining
                | CallError::Transport(_)
        )
    }
}

/// Failure while negotiating identity on a new connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer rejected identity: {0}")]
    Rejected(String),
    #[error("unknown controller {0}")]
    UnknownController(String),
    #[error("controller {0} has been revoked")]
    Revoked(String),
    #[error("expected a {expected} controller, peer announced {announced}")]
    KindMismatch { expected: String, announced: String },
    #[error("protocol revision mismatch: ours {ours}, theirs {theirs}")]
    ProtocolMismatch { ours: u32, theirs: u32 },
    #[error("handshake timed out")]
    Timeout,
    #[error("transport error during handshake: {0}")]
    Transport(String),
    #[error("unexpected frame during handshake: {0}")]
    UnexpectedFrame(String),
}

impl Classify for HandshakeError {
    fn class(&self) -> ErrorClass {
        match self {
            HandshakeError::Rejected(_)
            | HandshakeError::UnknownController(_)
            | HandshakeError::Revoked(_)
            | HandshakeError::KindMismatch { .. }
            | HandshakeError::ProtocolMismatch { .. } => ErrorClass::FatalIdentity,
            HandshakeError::Timeout
            | HandshakeError::Transport(_)
            | HandshakeError::UnexpectedFrame(_) => ErrorClass::TransientTransport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::TransientTransport.is_retryable());
        assert!(ErrorClass::TransientHardware.is_retryable());
        assert!(!ErrorClass::CapabilityPermanent.is_retryable());
        assert!(!ErrorClass::Coordination.is_retryable());
        assert!(!ErrorClass::FatalIdentity.is_retryable());
    }

    #[test]
    fn test_remote_error_keeps_its_class() {
        let err = CallError::from(RemoteError::new(ErrorClass::TransientHardware, "bmc busy"));
        assert_eq!(err.class(), ErrorClass::TransientHardware);
        assert!(!err.is_connection_fault());
    }

    #[test]
    fn test_identity_failures_are_fatal() {
        assert_eq!(
            HandshakeError::Revoked("rack-a".into()).class(),
            ErrorClass::FatalIdentity
        );
        assert_eq!(HandshakeError::Timeout.class(), ErrorClass::TransientTransport);
    }
}
