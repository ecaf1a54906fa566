//! Rack controller observability
//!
//! - `metrics`: driver retries, reconnects and served services
//! - `events`: structured rack-side events

pub mod events;
pub mod metrics;

pub use metrics::init_metrics;
