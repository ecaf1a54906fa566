//! Observability shared by both controllers
//!
//! - `tracing`: subscriber setup with optional OTLP export
//! - `events`: structured connection events with an `event_type` field
//! - `metrics`: connection and call metrics

pub mod events;
pub mod metrics;
pub mod tracing;

pub use self::tracing::{init_tracing, shutdown_tracing, TracingConfig};
