//! Rack Sessions
//!
//! The `RegionSession` actor owns the registry of rack connections held by
//! this region process: one connection per rack, the newest wins and the
//! replaced one is drained. Other components only receive snapshots or a
//! routed `Connection` handle.
//!
//! - `listener`: TCP accept loop and identity negotiation
//! - `handler`: requests racks send to the region
//! - `health`: periodic ping of every registered rack

pub mod handler;
pub mod health;
pub mod listener;

pub use handler::RegionHandler;
pub use health::{spawn_health_loop, HealthConfig};
pub use listener::{AcceptError, Acceptor};

use crate::election::{ElectionCoordinator, RackAvailable, RackLost};
use crate::observability::{events, metrics};
use crate::store::{Store, StoreError};
use chrono::Utc;
use futures::future::join_all;
use ironfleet_core::connection::{Connection, ConnectionInfo};
use ironfleet_core::error::CallError;
use ironfleet_core::ids::{ConnectionId, ControllerId};
use ironfleet_core::models::{ControllerKind, ControllerRecord};
use ironfleet_core::protocol::{Reply, Request};
use kameo::prelude::*;
use kameo::Reply as KameoReply;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Actor)]
pub struct RegionSession {
    store: Store,
    election: ActorRef<ElectionCoordinator>,
    racks: HashMap<ControllerId, Connection>,
    drain_grace: Duration,
}

impl RegionSession {
    pub fn new(
        store: Store,
        election: ActorRef<ElectionCoordinator>,
        drain_grace: Duration,
    ) -> Self {
        Self {
            store,
            election,
            racks: HashMap::new(),
            drain_grace,
        }
    }

    /// Merge the advertised capabilities into the durable record, keeping the
    /// first registration time of each segment.
    async fn record_registration(&self, connection: &Connection) -> Result<ControllerRecord, StoreError> {
        let peer = connection.peer();
        let now = Utc::now();
        let mut record = self
            .store
            .get_controller(&peer.id)
            .await?
            .unwrap_or_else(|| ControllerRecord::new(peer.id, ControllerKind::Rack, peer.name.clone()));
        record.name = peer.name.clone();
        record.merge_capabilities(&peer.segments, now);
        record.last_seen = Some(now);
        self.store.put_controller(&record).await?;
        Ok(record)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("connection {0} is no longer usable")]
    Unusable(ConnectionId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Register an accepted rack connection.
#[derive(Debug, Clone)]
pub struct Register {
    pub connection: Connection,
}

/// Remove a closed connection. Ignored unless it is the rack's current one.
#[derive(Debug, Clone)]
pub struct Unregister {
    pub rack: ControllerId,
    pub connection: ConnectionId,
}

/// Usable connection to a rack, if registered here.
#[derive(Debug, Clone)]
pub struct Route {
    pub rack: ControllerId,
}

#[derive(Debug, Clone, KameoReply)]
pub struct Routed {
    pub connection: Option<Connection>,
}

#[derive(Debug, Clone)]
pub struct Snapshot;

#[derive(Debug, Clone, KameoReply)]
pub struct SessionSnapshot {
    pub connections: Vec<Connection>,
}

impl SessionSnapshot {
    pub fn infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.connections.iter().map(Connection::info).collect();
        infos.sort_by(|a, b| a.peer_name.cmp(&b.peer_name));
        infos
    }
}

#[derive(Debug, Clone)]
pub struct ConnectedRacks;

#[derive(Debug, Clone, KameoReply)]
pub struct RackList {
    pub racks: Vec<ControllerId>,
}

impl Message<Register> for RegionSession {
    type Reply = Result<ControllerRecord, RegisterError>;

    async fn handle(&mut self, msg: Register, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let connection = msg.connection;
        let rack = connection.peer().id;
        if !connection.is_usable() {
            debug!(
                rack_id = %rack,
                connection_id = %connection.id(),
                health = %connection.health(),
                "Refusing to register a connection that is no longer usable"
            );
            return Err(RegisterError::Unusable(connection.id()));
        }
        let record = self.record_registration(&connection).await?;

        if let Some(previous) = self.racks.insert(rack, connection.clone()) {
            if previous.id() != connection.id() {
                info!(
                    rack_id = %rack,
                    old_connection = %previous.id(),
                    new_connection = %connection.id(),
                    "Rack reconnected, draining replaced connection"
                );
                let grace = self.drain_grace;
                tokio::spawn(async move { previous.drain(grace).await });
            }
        }

        events::rack_registered(
            &rack.to_string(),
            &record.name,
            &connection.id().to_string(),
            record.segments.len(),
        );
        metrics::set_racks_connected(self.racks.len());

        let available = RackAvailable {
            record: record.clone(),
            connection,
        };
        if let Err(e) = self.election.tell(available).send().await {
            warn!(rack_id = %rack, error = %e, "Failed to notify election of new rack");
        }
        Ok(record)
    }
}

impl Message<Unregister> for RegionSession {
    type Reply = ();

    async fn handle(&mut self, msg: Unregister, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let current = self
            .racks
            .get(&msg.rack)
            .is_some_and(|c| c.id() == msg.connection);
        if !current {
            debug!(
                rack_id = %msg.rack,
                connection_id = %msg.connection,
                "Closed connection was already replaced"
            );
            return;
        }

        self.racks.remove(&msg.rack);
        events::rack_unregistered(&msg.rack.to_string(), &msg.connection.to_string());
        metrics::set_racks_connected(self.racks.len());

        let lost = RackLost {
            rack: msg.rack,
            connection: msg.connection,
        };
        if let Err(e) = self.election.tell(lost).send().await {
            warn!(rack_id = %msg.rack, error = %e, "Failed to notify election of lost rack");
        }
    }
}

impl Message<Route> for RegionSession {
    type Reply = Routed;

    async fn handle(&mut self, msg: Route, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Routed {
            connection: self
                .racks
                .get(&msg.rack)
                .filter(|c| c.is_usable())
                .cloned(),
        }
    }
}

impl Message<Snapshot> for RegionSession {
    type Reply = SessionSnapshot;

    async fn handle(&mut self, _msg: Snapshot, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        SessionSnapshot {
            connections: self.racks.values().cloned().collect(),
        }
    }
}

impl Message<ConnectedRacks> for RegionSession {
    type Reply = RackList;

    async fn handle(
        &mut self,
        _msg: ConnectedRacks,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut racks: Vec<_> = self
            .racks
            .iter()
            .filter(|(_, c)| c.is_usable())
            .map(|(id, _)| *id)
            .collect();
        racks.sort();
        RackList { racks }
    }
}

/// Send `request` to every registered rack concurrently.
pub async fn broadcast(
    session: &ActorRef<RegionSession>,
    request: Request,
    deadline: Duration,
) -> Vec<(ControllerId, Result<Reply, CallError>)> {
    let snapshot = match session.ask(Snapshot).send().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Session unavailable for broadcast");
            return Vec::new();
        }
    };

    let calls = snapshot
        .connections
        .into_iter()
        .filter(|c| c.is_usable())
        .map(|connection| {
            let request = request.clone();
            async move {
                let rack = connection.peer().id;
                (rack, connection.call(request, deadline).await)
            }
        });
    join_all(calls).await
}

/// Usable connection to `rack`, or `None` when it is not registered here.
pub async fn route(session: &ActorRef<RegionSession>, rack: ControllerId) -> Option<Connection> {
    match session.ask(Route { rack }).send().await {
        Ok(routed) => routed.connection,
        Err(e) => {
            warn!(rack_id = %rack, error = %e, "Session unavailable for routing");
            None
        }
    }
}
