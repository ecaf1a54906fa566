//! Long-lived rack↔region connections
//!
//! - `handshake`: identity negotiation on a fresh transport
//! - `connection`: the established, bidirectional call channel
//! - `stats`: RTT/error bookkeeping behind connection preference
//! - `window`: timeout budget that closes a connection which keeps stalling

#[allow(clippy::module_inception)]
mod connection;
pub mod handshake;
mod stats;
mod window;

pub use connection::{
    CallContext, CallHandler, Connection, ConnectionConfig, ConnectionEvent, ConnectionInfo,
    EventSink,
};
pub use handshake::{framed, FramedTransport};
pub use stats::CallStats;
pub use window::{TimeoutPolicy, TimeoutWindow};
