//! Service Ownership Endpoints

use super::{ApiError, AppState};
use crate::election::{ElectionStatus, GetAssignments, Override};
use axum::extract::State;
use axum::Json;
use ironfleet_core::models::ServiceAssignment;
use kameo::error::SendError;

/// GET /assignments - every stored assignment plus election pass counters
#[tracing::instrument(skip(state))]
pub async fn list_assignments(
    State(state): State<AppState>,
) -> Result<Json<ElectionStatus>, ApiError> {
    match state.election.ask(GetAssignments).send().await {
        Ok(status) => Ok(Json(status)),
        Err(SendError::HandlerError(e)) => Err(e.into()),
        Err(e) => Err(ApiError::unavailable(e.to_string())),
    }
}

/// POST /assignments/override - pin an owner, or unpin with `rack: null`
#[tracing::instrument(skip(state))]
pub async fn override_owner(
    State(state): State<AppState>,
    Json(request): Json<Override>,
) -> Result<Json<ServiceAssignment>, ApiError> {
    match state.election.ask(request).send().await {
        Ok(assignment) => Ok(Json(assignment)),
        Err(SendError::HandlerError(e)) => Err(e.into()),
        Err(e) => Err(ApiError::unavailable(e.to_string())),
    }
}
