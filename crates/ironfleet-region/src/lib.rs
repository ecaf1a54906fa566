//! ironfleet region controller
//!
//! Holds the rack connections of a region, elects one rack per segment and
//! service, and runs the machine lifecycle by dispatching steps to the
//! elected racks.

pub mod api;
pub mod config;
pub mod election;
pub mod lifecycle;
pub mod observability;
pub mod server;
pub mod session;
pub mod store;

pub use config::{RegionArgs, RegionConfig, StoreKind};
pub use server::{open_store, Region};
