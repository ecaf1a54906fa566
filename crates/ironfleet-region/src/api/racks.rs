//! Rack Endpoints
//!
//! The controller directory joined with the connections this region holds.
//! Enrolling and revoking only touch the directory; a revoked rack that is
//! connected is closed immediately and refused on reconnect.

use super::{ApiError, AppState};
use crate::session::{route, Snapshot};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use ironfleet_core::connection::ConnectionInfo;
use ironfleet_core::ids::ControllerId;
use ironfleet_core::models::{ControllerKind, ControllerRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct RackView {
    #[serde(flatten)]
    pub record: ControllerRecord,
    /// Present while the rack is connected to this region.
    pub connection: Option<ConnectionInfo>,
}

#[derive(Debug, Serialize)]
pub struct RacksResponse {
    pub racks: Vec<RackView>,
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    #[serde(default)]
    pub id: Option<ControllerId>,
    pub name: String,
}

#[tracing::instrument(skip(state))]
pub async fn list_racks(State(state): State<AppState>) -> Result<Json<RacksResponse>, ApiError> {
    let records = state.store.list_controllers().await?;
    let snapshot = state
        .session
        .ask(Snapshot)
        .send()
        .await
        .map_err(|e| ApiError::unavailable(e.to_string()))?;
    let mut connections: HashMap<ControllerId, ConnectionInfo> = snapshot
        .infos()
        .into_iter()
        .map(|info| (info.peer, info))
        .collect();

    let mut racks: Vec<RackView> = records
        .into_iter()
        .filter(|r| r.kind == ControllerKind::Rack)
        .map(|record| RackView {
            connection: connections.remove(&record.id),
            record,
        })
        .collect();
    racks.sort_by(|a, b| a.record.name.cmp(&b.record.name));
    Ok(Json(RacksResponse { racks }))
}

#[tracing::instrument(skip(state, request), fields(name = %request.name))]
pub async fn enroll_rack(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<ControllerRecord>), ApiError> {
    let id = request.id.unwrap_or_default();
    if let Some(existing) = state.store.get_controller(&id).await? {
        return Ok((StatusCode::OK, Json(existing)));
    }

    let record = ControllerRecord::new(id, ControllerKind::Rack, request.name);
    state.store.put_controller(&record).await?;
    info!(rack_id = %record.id, rack_name = %record.name, "Rack enrolled");
    Ok((StatusCode::CREATED, Json(record)))
}

#[tracing::instrument(skip(state))]
pub async fn revoke_rack(
    State(state): State<AppState>,
    Path(id): Path<ControllerId>,
) -> Result<Json<ControllerRecord>, ApiError> {
    let mut record = state
        .store
        .get_controller(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("unknown rack {id}")))?;
    record.revoked = true;
    state.store.put_controller(&record).await?;
    info!(rack_id = %id, "Rack revoked");

    if let Some(connection) = route(&state.session, id).await {
        connection.close("controller revoked");
    }
    Ok(Json(record))
}
