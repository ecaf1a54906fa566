//! Region observability
//!
//! - `events`: structured domain events with an `event_type` field
//! - `metrics`: Prometheus recorder and region metrics
//!
//! Tracing setup is shared with the rack and lives in
//! `ironfleet_core::observability`.

pub mod events;
pub mod metrics;

pub use metrics::{init_metrics, MetricsState};
