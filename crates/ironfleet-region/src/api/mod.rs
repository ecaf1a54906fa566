//! HTTP API Module
//!
//! Operator surface of the region controller.
//!
//! - `state`: shared application state
//! - `health`: liveness and readiness probes
//! - `metrics`: Prometheus endpoint
//! - `machines`: machine registration, reads and lifecycle commands
//! - `racks`: controller directory and live connections
//! - `assignments`: service ownership and manual override
//! - `events`: server-sent stream of lifecycle events

mod assignments;
mod error;
mod events;
mod health;
mod machines;
mod metrics;
mod racks;
mod state;

pub use error::ApiError;
pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health checks
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Observability
        .route("/metrics", get(metrics::get_metrics))
        .route("/events", get(events::stream_events))
        // Machines
        .route(
            "/machines",
            get(machines::list_machines).post(machines::register_machine),
        )
        .route("/machines/{id}", get(machines::get_machine))
        .route("/machines/{id}/commands", post(machines::submit_command))
        // Racks
        .route("/racks", get(racks::list_racks).post(racks::enroll_rack))
        .route("/racks/{id}/revoke", post(racks::revoke_rack))
        // Service ownership
        .route("/assignments", get(assignments::list_assignments))
        .route("/assignments/override", post(assignments::override_owner))
        .with_state(state)
}
