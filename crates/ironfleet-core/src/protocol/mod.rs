//! Rack↔Region wire protocol
//!
//! A connection carries four kinds of traffic:
//! - identity negotiation (`Hello` / `Welcome` / `Rejected`)
//! - request/response pairs correlated by a per-connection sequence number
//! - unsolicited events
//! - graceful half-close (`Drain` then `Goodbye`)

mod codec;
mod frames;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_LENGTH};
pub use frames::{Event, Frame, Reply, Request, ScriptStatus, ServingGrant};
