//! ironfleet rack controller
//!
//! Keeps connections to every configured region, serves the network services
//! it has been granted, and executes power and script operations on the
//! machines it can reach.

pub mod agent;
pub mod capability;
pub mod config;
pub mod observability;
pub mod services;
pub mod session;

pub use agent::Agent;
pub use config::{RackArgs, RackConfig};
pub use services::ServiceHost;
pub use session::{RackSession, SessionConfig, SessionDeps};
