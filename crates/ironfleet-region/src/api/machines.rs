//! Machine Endpoints
//!
//! - `GET /machines` - summary of every machine
//! - `POST /machines` - register a machine in `new`
//! - `GET /machines/{id}` - full record with transition history
//! - `POST /machines/{id}/commands` - request a lifecycle command

use super::{ApiError, AppState};
use crate::lifecycle::{
    Command, InFlightStep, LifecycleState, MachineRecord, MachineRegistration, TransitionTicket,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use ironfleet_core::ids::{ControllerId, MachineId, SegmentId, TransitionId};
use ironfleet_core::models::PowerState;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct MachineSummary {
    pub id: MachineId,
    pub hostname: String,
    pub segment: SegmentId,
    pub rack_of_record: Option<ControllerId>,
    pub state: LifecycleState,
    pub power_state: PowerState,
    pub owner: Option<String>,
    pub transition: Option<TransitionId>,
    pub in_flight: Option<InFlightStep>,
}

impl From<&MachineRecord> for MachineSummary {
    fn from(record: &MachineRecord) -> Self {
        Self {
            id: record.id,
            hostname: record.hostname.clone(),
            segment: record.segment,
            rack_of_record: record.rack_of_record,
            state: record.state,
            power_state: record.power_state,
            owner: record.owner.clone(),
            transition: record.active.as_ref().map(|a| a.record.id),
            in_flight: record.in_flight().cloned(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MachinesResponse {
    pub machines: Vec<MachineSummary>,
}

#[tracing::instrument(skip(state))]
pub async fn list_machines(State(state): State<AppState>) -> Json<MachinesResponse> {
    let machines = state
        .engine
        .machines()
        .await
        .iter()
        .map(MachineSummary::from)
        .collect();
    Json(MachinesResponse { machines })
}

#[tracing::instrument(skip(state, registration), fields(hostname = %registration.hostname))]
pub async fn register_machine(
    State(state): State<AppState>,
    Json(registration): Json<MachineRegistration>,
) -> Result<(StatusCode, Json<MachineRecord>), ApiError> {
    let record = state.engine.register_machine(registration).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[tracing::instrument(skip(state))]
pub async fn get_machine(
    State(state): State<AppState>,
    Path(id): Path<MachineId>,
) -> Result<Json<MachineRecord>, ApiError> {
    Ok(Json(state.engine.machine(id).await?))
}

/// Accepted commands answer 202; a duplicate of the transition already in
/// progress answers 200 with the same ticket.
#[tracing::instrument(skip(state))]
pub async fn submit_command(
    State(state): State<AppState>,
    Path(id): Path<MachineId>,
    Json(command): Json<Command>,
) -> Result<(StatusCode, Json<TransitionTicket>), ApiError> {
    let ticket = state.engine.request(id, command).await?;
    let status = if ticket.coalesced {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(ticket)))
}
