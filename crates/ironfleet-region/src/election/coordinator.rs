//! ElectionCoordinator Actor
//!
//! Tracks which racks are connected and what they advertise, and turns each
//! membership change into exactly one `Elect` per affected segment.

use super::elector::SegmentElector;
use super::messages::{
    Elect, ElectionStatus, GetAssignments, GetElectorStatus, OverrideReply, Override,
    OwnerStopped, Pin, RackAvailable, RackLost, Redeliver, SegmentCandidate, Trigger,
};
use super::{ElectionConfig, ElectionError};
use crate::store::Store;
use ironfleet_core::connection::Connection;
use ironfleet_core::ids::{ControllerId, SegmentId};
use ironfleet_core::models::ControllerRecord;
use kameo::error::SendError;
use kameo::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

struct ConnectedRack {
    record: ControllerRecord,
    connection: Connection,
}

#[derive(Actor)]
pub struct ElectionCoordinator {
    store: Store,
    config: ElectionConfig,
    racks: HashMap<ControllerId, ConnectedRack>,
    electors: HashMap<SegmentId, ActorRef<SegmentElector>>,
}

impl ElectionCoordinator {
    pub fn new(store: Store, config: ElectionConfig) -> Self {
        Self {
            store,
            config,
            racks: HashMap::new(),
            electors: HashMap::new(),
        }
    }

    fn elector(&mut self, segment: SegmentId) -> ActorRef<SegmentElector> {
        self.electors
            .entry(segment)
            .or_insert_with(|| {
                debug!(segment_id = %segment, "Spawning segment elector");
                SegmentElector::spawn(SegmentElector::new(
                    segment,
                    self.store.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    fn candidates(&self, segment: SegmentId) -> Vec<SegmentCandidate> {
        self.racks
            .values()
            .filter_map(|rack| {
                let registration = rack.record.segments.get(&segment)?;
                Some(SegmentCandidate {
                    rack: rack.record.id,
                    name: rack.record.name.clone(),
                    registered_at: registration.registered_at,
                    services: registration.services.clone(),
                    connection: rack.connection.clone(),
                })
            })
            .collect()
    }

    async fn elect(&mut self, segment: SegmentId, trigger: Trigger) {
        let candidates = self.candidates(segment);
        let elector = self.elector(segment);
        if let Err(e) = elector.tell(Elect { trigger, candidates }).send().await {
            warn!(segment_id = %segment, error = %e, "Failed to reach segment elector");
        }
    }
}

impl Message<RackAvailable> for ElectionCoordinator {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RackAvailable,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let rack = msg.record.id;
        let segments: Vec<SegmentId> = msg.record.segments.keys().copied().collect();
        info!(
            rack_id = %rack,
            segments = segments.len(),
            "Rack available for election"
        );

        // Segments the rack no longer advertises must also be re-run.
        let mut affected = segments.clone();
        if let Some(previous) = self.racks.get(&rack) {
            affected.extend(
                previous
                    .record
                    .segments
                    .keys()
                    .filter(|s| !segments.contains(s)),
            );
        }

        self.racks.insert(
            rack,
            ConnectedRack {
                record: msg.record,
                connection: msg.connection,
            },
        );
        for segment in affected {
            self.elect(segment, Trigger::RackAvailable).await;
        }
    }
}

impl Message<RackLost> for ElectionCoordinator {
    type Reply = ();

    async fn handle(&mut self, msg: RackLost, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let current = self
            .racks
            .get(&msg.rack)
            .is_some_and(|r| r.connection.id() == msg.connection);
        if !current {
            debug!(
                rack_id = %msg.rack,
                connection_id = %msg.connection,
                "Ignoring loss of a superseded connection"
            );
            return;
        }

        let Some(lost) = self.racks.remove(&msg.rack) else {
            return;
        };
        info!(
            rack_id = %msg.rack,
            segments = lost.record.segments.len(),
            "Rack lost, re-electing its segments"
        );
        for segment in lost.record.segments.keys().copied() {
            self.elect(segment, Trigger::RackLost).await;
        }
    }
}

impl Message<OwnerStopped> for ElectionCoordinator {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: OwnerStopped,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if !self.racks.contains_key(&msg.rack) {
            return;
        }
        let elector = self.elector(msg.grant.segment);
        let redeliver = Redeliver {
            rack: msg.rack,
            grant: msg.grant,
        };
        if let Err(e) = elector.tell(redeliver).send().await {
            warn!(segment_id = %msg.grant.segment, error = %e, "Failed to reach segment elector");
        }
    }
}

impl Message<Override> for ElectionCoordinator {
    type Reply = OverrideReply;

    async fn handle(&mut self, msg: Override, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let candidates = self.candidates(msg.segment);
        if let Some(rack) = msg.rack {
            let capable = candidates
                .iter()
                .any(|c| c.rack == rack && c.services.contains(&msg.service));
            if !capable {
                return Err(ElectionError::NotCandidate {
                    rack,
                    segment: msg.segment,
                    service: msg.service,
                });
            }
        }

        let elector = self.elector(msg.segment);
        let pin = Pin {
            service: msg.service,
            rack: msg.rack,
            candidates,
        };
        match elector.ask(pin).send().await {
            Ok(assignment) => Ok(assignment),
            Err(SendError::HandlerError(e)) => Err(e),
            Err(_) => Err(ElectionError::Unavailable(format!(
                "elector for segment {} is not running",
                msg.segment
            ))),
        }
    }
}

impl Message<GetAssignments> for ElectionCoordinator {
    type Reply = Result<ElectionStatus, ElectionError>;

    async fn handle(
        &mut self,
        _msg: GetAssignments,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let assignments = self.store.list_assignments().await?;
        let mut passes = BTreeMap::new();
        for (segment, elector) in &self.electors {
            match elector.ask(GetElectorStatus).send().await {
                Ok(status) => {
                    passes.insert(*segment, status.passes);
                }
                Err(e) => {
                    warn!(segment_id = %segment, error = %e, "Failed to query segment elector");
                }
            }
        }
        Ok(ElectionStatus {
            assignments,
            passes,
        })
    }
}
