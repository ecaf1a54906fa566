//! SegmentElector Actor
//!
//! One actor per segment. Its mailbox serializes every pass for the segment,
//! so an epoch bump completes before the next trigger is looked at. Passes
//! for different segments run on different actors.

use super::messages::{
    Acknowledged, Elect, ElectorStatus, GetElectorStatus, Pin, Redeliver, SegmentCandidate,
    Trigger,
};
use super::policy::{choose_owner, Candidate};
use super::{ElectionConfig, ElectionError};
use crate::observability::{events, metrics};
use crate::store::Store;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use ironfleet_core::connection::Connection;
use ironfleet_core::error::{CallError, Classify};
use ironfleet_core::ids::{ConnectionId, ControllerId, SegmentId};
use ironfleet_core::models::{ServiceAssignment, ServiceKind};
use ironfleet_core::protocol::{Reply, Request};
use kameo::prelude::*;
use std::collections::{BTreeMap, HashMap};
use strum::IntoEnumIterator;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// In-progress or finished `StartServing` delivery for one service.
struct Delivery {
    owner: ControllerId,
    connection: ConnectionId,
    epoch: u64,
    confirmed: bool,
    task: JoinHandle<()>,
}

impl Delivery {
    fn covers(&self, owner: ControllerId, connection: ConnectionId, epoch: u64) -> bool {
        self.owner == owner
            && self.connection == connection
            && self.epoch == epoch
            && (self.confirmed || !self.task.is_finished())
    }
}

#[derive(Actor)]
pub struct SegmentElector {
    segment: SegmentId,
    store: Store,
    config: ElectionConfig,
    candidates: BTreeMap<ControllerId, SegmentCandidate>,
    pinned: HashMap<ServiceKind, ControllerId>,
    deliveries: HashMap<ServiceKind, Delivery>,
    passes: u64,
}

impl SegmentElector {
    pub fn new(segment: SegmentId, store: Store, config: ElectionConfig) -> Self {
        Self {
            segment,
            store,
            config,
            candidates: BTreeMap::new(),
            pinned: HashMap::new(),
            deliveries: HashMap::new(),
            passes: 0,
        }
    }

    fn replace_candidates(&mut self, candidates: Vec<SegmentCandidate>) {
        self.candidates = candidates.into_iter().map(|c| (c.rack, c)).collect();
    }

    fn candidates_for(&self, service: ServiceKind) -> Vec<Candidate> {
        self.candidates
            .values()
            .filter(|c| c.services.contains(&service))
            .map(|c| Candidate {
                rack: c.rack,
                registered_at: c.registered_at,
            })
            .collect()
    }

    async fn run_pass(&mut self, trigger: Trigger, me: &ActorRef<Self>) {
        self.passes += 1;
        metrics::record_election(trigger.as_str());
        debug!(
            segment_id = %self.segment,
            trigger = trigger.as_str(),
            candidates = self.candidates.len(),
            pass = self.passes,
            "Running election pass"
        );

        for service in ServiceKind::iter() {
            let relevant = self.candidates.values().any(|c| c.services.contains(&service))
                || self.deliveries.contains_key(&service);
            if !relevant && !self.is_recorded(service).await {
                continue;
            }
            if let Err(e) = self.elect_service(service, trigger, me).await {
                warn!(
                    segment_id = %self.segment,
                    service = %service,
                    error = %e,
                    "Election pass failed for service"
                );
            }
        }
    }

    /// Whether the store holds an assignment for the pair at all.
    async fn is_recorded(&self, service: ServiceKind) -> bool {
        matches!(
            self.store.load_assignment(self.segment, service).await,
            Ok(current) if current.revision != 0
        )
    }

    async fn elect_service(
        &mut self,
        service: ServiceKind,
        trigger: Trigger,
        me: &ActorRef<Self>,
    ) -> Result<(), ElectionError> {
        for _ in 0..self.config.cas_attempts {
            let current = self.store.load_assignment(self.segment, service).await?;
            let candidates = self.candidates_for(service);
            let chosen = choose_owner(
                current.value.owner,
                self.pinned.get(&service).copied(),
                &candidates,
            );

            if chosen == current.value.owner {
                if let Some(owner) = chosen {
                    self.ensure_delivery(service, owner, current.value.epoch, me);
                }
                return Ok(());
            }

            let next = ServiceAssignment {
                segment: self.segment,
                service,
                owner: chosen,
                epoch: current.value.epoch + 1,
                confirmed: false,
                elected_at: Some(Utc::now()),
            };
            if !self.store.swap_assignment(current.revision, &next).await? {
                debug!(
                    segment_id = %self.segment,
                    service = %service,
                    "Assignment changed underneath us, reloading"
                );
                continue;
            }

            let previous = current.value.owner;
            events::owner_elected(
                &self.segment.to_string(),
                &service.to_string(),
                previous.map(|p| p.to_string()).as_deref(),
                chosen.map(|c| c.to_string()).as_deref(),
                next.epoch,
                trigger.as_str(),
            );
            metrics::record_owner_change(&self.segment.to_string(), &service.to_string(), next.epoch);

            if let Some(delivery) = self.deliveries.remove(&service) {
                delivery.task.abort();
            }
            if let Some(previous) = previous {
                self.stop_previous(previous, service, next.epoch);
            }
            if let Some(owner) = chosen {
                self.ensure_delivery(service, owner, next.epoch, me);
            }
            return Ok(());
        }

        Err(ElectionError::Contention {
            segment: self.segment,
            service,
        })
    }

    /// Best-effort `StopServing` to a previous owner that is still connected.
    fn stop_previous(&self, rack: ControllerId, service: ServiceKind, epoch: u64) {
        let Some(candidate) = self.candidates.get(&rack) else {
            return;
        };
        let connection = candidate.connection.clone();
        let segment = self.segment;
        let deadline = self.config.notify_timeout;
        tokio::spawn(async move {
            let request = Request::StopServing {
                segment,
                service,
                epoch,
            };
            if let Err(e) = connection.call(request, deadline).await {
                debug!(
                    segment_id = %segment,
                    service = %service,
                    rack_id = %rack,
                    error = %e,
                    "StopServing to previous owner failed"
                );
            }
        });
    }

    fn ensure_delivery(
        &mut self,
        service: ServiceKind,
        owner: ControllerId,
        epoch: u64,
        me: &ActorRef<Self>,
    ) {
        let Some(candidate) = self.candidates.get(&owner) else {
            return;
        };
        let connection = candidate.connection.clone();
        if let Some(existing) = self.deliveries.get(&service) {
            if existing.covers(owner, connection.id(), epoch) {
                return;
            }
            existing.task.abort();
        }

        let task = tokio::spawn(deliver(
            connection.clone(),
            self.segment,
            service,
            epoch,
            self.config.clone(),
            me.clone(),
        ));
        self.deliveries.insert(
            service,
            Delivery {
                owner,
                connection: connection.id(),
                epoch,
                confirmed: false,
                task,
            },
        );
    }

    async fn confirm(&mut self, ack: Acknowledged) -> Result<(), ElectionError> {
        for _ in 0..self.config.cas_attempts {
            let current = self.store.load_assignment(self.segment, ack.service).await?;
            if current.value.epoch != ack.epoch || current.value.owner != Some(ack.owner) {
                events::stale_claim_discarded(
                    &self.segment.to_string(),
                    &ack.service.to_string(),
                    ack.epoch,
                    current.value.epoch,
                    "start_serving_ack",
                );
                return Ok(());
            }
            if current.value.confirmed {
                return Ok(());
            }

            let mut next = current.value.clone();
            next.confirmed = true;
            if self.store.swap_assignment(current.revision, &next).await? {
                events::owner_confirmed(
                    &self.segment.to_string(),
                    &ack.service.to_string(),
                    &ack.owner.to_string(),
                    ack.epoch,
                );
                return Ok(());
            }
        }
        Err(ElectionError::Contention {
            segment: self.segment,
            service: ack.service,
        })
    }
}

/// Retry `StartServing` until the rack answers or its connection closes.
async fn deliver(
    connection: Connection,
    segment: SegmentId,
    service: ServiceKind,
    epoch: u64,
    config: ElectionConfig,
    elector: ActorRef<SegmentElector>,
) {
    let owner = connection.peer().id;
    let mut backoff = ExponentialBackoff {
        current_interval: config.notify_backoff_initial,
        initial_interval: config.notify_backoff_initial,
        multiplier: 2.0,
        max_interval: config.notify_backoff_max,
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        let request = Request::StartServing {
            segment,
            service,
            epoch,
        };
        let result = tokio::select! {
            _ = connection.closed() => return,
            result = connection.call(request, config.notify_timeout) => result,
        };

        match result {
            Ok(Reply::Serving {
                epoch: held_epoch,
                accepted,
            }) => {
                let ack = Acknowledged {
                    service,
                    owner,
                    epoch,
                    accepted,
                    held_epoch,
                };
                if let Err(e) = elector.tell(ack).send().await {
                    debug!(segment_id = %segment, error = %e, "Elector gone before acknowledgement");
                }
                return;
            }
            Ok(other) => {
                warn!(
                    segment_id = %segment,
                    service = %service,
                    reply = ?other,
                    "Unexpected reply to StartServing"
                );
                return;
            }
            Err(CallError::Closed) => return,
            Err(e) if !e.class().is_retryable() => {
                warn!(
                    segment_id = %segment,
                    service = %service,
                    rack_id = %owner,
                    error = %e,
                    "Rack refused StartServing"
                );
                return;
            }
            Err(e) => {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or(config.notify_backoff_max);
                debug!(
                    segment_id = %segment,
                    service = %service,
                    rack_id = %owner,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "StartServing not acknowledged, retrying"
                );
                tokio::select! {
                    _ = connection.closed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

impl Message<Elect> for SegmentElector {
    type Reply = ();

    async fn handle(&mut self, msg: Elect, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.replace_candidates(msg.candidates);
        let me = ctx.actor_ref().clone();
        self.run_pass(msg.trigger, &me).await;
    }
}

impl Message<Pin> for SegmentElector {
    type Reply = Result<ServiceAssignment, ElectionError>;

    async fn handle(&mut self, msg: Pin, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.replace_candidates(msg.candidates);
        match msg.rack {
            Some(rack) => {
                info!(segment_id = %self.segment, service = %msg.service, rack_id = %rack, "Pinning service owner");
                self.pinned.insert(msg.service, rack);
            }
            None => {
                info!(segment_id = %self.segment, service = %msg.service, "Clearing service owner pin");
                self.pinned.remove(&msg.service);
            }
        }

        let me = ctx.actor_ref().clone();
        self.passes += 1;
        metrics::record_election(Trigger::Override.as_str());
        self.elect_service(msg.service, Trigger::Override, &me).await?;
        Ok(self
            .store
            .load_assignment(self.segment, msg.service)
            .await?
            .value)
    }
}

impl Message<Redeliver> for SegmentElector {
    type Reply = ();

    async fn handle(&mut self, msg: Redeliver, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let service = msg.grant.service;
        let current = match self.store.load_assignment(self.segment, service).await {
            Ok(current) => current.value,
            Err(e) => {
                warn!(segment_id = %self.segment, error = %e, "Failed to load assignment for redelivery");
                return;
            }
        };
        if current.owner != Some(msg.rack) || current.epoch != msg.grant.epoch {
            events::stale_claim_discarded(
                &self.segment.to_string(),
                &service.to_string(),
                msg.grant.epoch,
                current.epoch,
                "service_stopped",
            );
            return;
        }
        if let Some(delivery) = self.deliveries.remove(&service) {
            delivery.task.abort();
        }
        let me = ctx.actor_ref().clone();
        self.ensure_delivery(service, msg.rack, current.epoch, &me);
    }
}

impl Message<Acknowledged> for SegmentElector {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Acknowledged,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let current_delivery = self
            .deliveries
            .get(&msg.service)
            .is_some_and(|d| d.owner == msg.owner && d.epoch == msg.epoch);
        if !msg.accepted || !current_delivery {
            events::stale_claim_discarded(
                &self.segment.to_string(),
                &msg.service.to_string(),
                msg.epoch,
                msg.held_epoch,
                "start_serving_ack",
            );
            return;
        }

        if let Some(delivery) = self.deliveries.get_mut(&msg.service) {
            delivery.confirmed = true;
        }
        if let Err(e) = self.confirm(msg).await {
            warn!(segment_id = %self.segment, error = %e, "Failed to record owner confirmation");
        }
    }
}

impl Message<GetElectorStatus> for SegmentElector {
    type Reply = ElectorStatus;

    async fn handle(
        &mut self,
        _msg: GetElectorStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        ElectorStatus {
            segment: self.segment,
            passes: self.passes,
        }
    }
}
