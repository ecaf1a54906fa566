//! LifecycleEngine
//!
//! Registry of machine actors. Loads every stored machine at start, spawns
//! one actor per machine and routes commands, reads and power observations
//! to it.

use super::actor::{Execute, GetRecord, MachineActor, PowerObserved, Resume};
use super::model::{Command, MachineRecord, MachineRegistration, TransitionTicket};
use super::step::{RackRouter, StepRunner};
use super::{LifecycleConfig, LifecycleError, LifecycleEvent};
use crate::observability::metrics;
use crate::store::Store;
use chrono::{DateTime, Utc};
use ironfleet_core::ids::MachineId;
use ironfleet_core::models::PowerState;
use kameo::error::SendError;
use kameo::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct LifecycleEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    runner: Arc<StepRunner>,
    events: broadcast::Sender<LifecycleEvent>,
    actors: RwLock<HashMap<MachineId, ActorRef<MachineActor>>>,
}

impl LifecycleEngine {
    pub fn new(store: Store, router: RackRouter, config: LifecycleConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let runner = Arc::new(StepRunner::new(router, config, events.clone()));
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                events,
                actors: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Spawn actors for every stored machine and resume their transitions.
    pub async fn start(&self) -> Result<usize, LifecycleError> {
        let records = self.inner.store.list_machines().await?;
        let count = records.len();
        let mut resumed = 0usize;

        for record in records {
            metrics::machine_state_moved(None, &record.state.to_string());
            let has_active = record.active.is_some();
            let id = record.id;
            let actor = self.spawn_actor(record);
            self.inner.actors.write().await.insert(id, actor.clone());
            if has_active {
                resumed += 1;
                if let Err(e) = actor.tell(Resume).send().await {
                    warn!(error = %e, "Failed to resume machine transition");
                }
            }
        }

        info!(machines = count, resumed = resumed, "Lifecycle engine started");
        Ok(count)
    }

    fn spawn_actor(&self, record: MachineRecord) -> ActorRef<MachineActor> {
        MachineActor::spawn(MachineActor::new(
            record,
            self.inner.store.clone(),
            self.inner.runner.clone(),
            self.inner.events.clone(),
        ))
    }

    async fn actor(&self, id: MachineId) -> Result<ActorRef<MachineActor>, LifecycleError> {
        self.inner
            .actors
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LifecycleError::UnknownMachine(id))
    }

    /// Add a machine in `new`. Registering an id that already exists
    /// returns the existing record.
    pub async fn register_machine(
        &self,
        registration: MachineRegistration,
    ) -> Result<MachineRecord, LifecycleError> {
        // Held until the actor is in the registry so concurrent registrations
        // of one id spawn a single actor.
        let mut actors = self.inner.actors.write().await;
        if let Some(existing) = actors.get(&registration.id).cloned() {
            drop(actors);
            debug!(machine_id = %registration.id, "Machine already registered");
            return existing
                .ask(GetRecord)
                .send()
                .await
                .map(|snapshot| snapshot.record)
                .map_err(|e| LifecycleError::Unavailable(e.to_string()));
        }

        let record = MachineRecord::new(registration);
        self.inner.store.put_machine(&record).await?;
        metrics::machine_state_moved(None, &record.state.to_string());
        info!(
            machine_id = %record.id,
            hostname = %record.hostname,
            segment_id = %record.segment,
            "Machine registered"
        );
        actors.insert(record.id, self.spawn_actor(record.clone()));
        Ok(record)
    }

    pub async fn request(
        &self,
        machine: MachineId,
        command: Command,
    ) -> Result<TransitionTicket, LifecycleError> {
        let actor = self.actor(machine).await?;
        match actor.ask(Execute { command }).send().await {
            Ok(ticket) => Ok(ticket),
            Err(SendError::HandlerError(e)) => Err(e),
            Err(e) => Err(LifecycleError::Unavailable(e.to_string())),
        }
    }

    pub async fn machine(&self, machine: MachineId) -> Result<MachineRecord, LifecycleError> {
        let actor = self.actor(machine).await?;
        actor
            .ask(GetRecord)
            .send()
            .await
            .map(|snapshot| snapshot.record)
            .map_err(|e| LifecycleError::Unavailable(e.to_string()))
    }

    /// Every machine, ordered by hostname.
    pub async fn machines(&self) -> Vec<MachineRecord> {
        let actors: Vec<_> = self.inner.actors.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(actors.len());
        for actor in actors {
            match actor.ask(GetRecord).send().await {
                Ok(snapshot) => records.push(snapshot.record),
                Err(e) => debug!(error = %e, "Skipping unavailable machine actor"),
            }
        }
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.id.cmp(&b.id)));
        records
    }

    /// Power state reported by a rack outside of any step.
    pub async fn power_observed(
        &self,
        machine: MachineId,
        state: PowerState,
        observed_at: DateTime<Utc>,
    ) {
        let Ok(actor) = self.actor(machine).await else {
            debug!(machine_id = %machine, "Power state for unknown machine");
            return;
        };
        if let Err(e) = actor.tell(PowerObserved { state, observed_at }).send().await {
            debug!(machine_id = %machine, error = %e, "Failed to deliver power observation");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }
}
