//! ironfleet core
//!
//! Types and plumbing shared by the region and rack controllers: typed
//! identifiers, the data model, the wire protocol, connection handling,
//! the error taxonomy and tracing setup.

pub mod connection;
pub mod error;
pub mod ids;
pub mod models;
pub mod observability;
pub mod protocol;
pub mod version;

pub use error::{CallError, Classify, ErrorClass, HandshakeError, RemoteError};
pub use ids::{ConnectionId, ControllerId, MachineId, SegmentId, StepId, TransitionId};
