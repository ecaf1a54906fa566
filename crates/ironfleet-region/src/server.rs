//! Region wiring
//!
//! Spawns the election coordinator, the rack session, the lifecycle engine
//! and the background loops, and routes connection events between them.

use crate::api::AppState;
use crate::config::{RegionConfig, StoreKind};
use crate::election::{ElectionCoordinator, OwnerStopped};
use crate::lifecycle::{LifecycleEngine, LifecycleError, RackRouter};
use crate::observability::MetricsState;
use crate::session::{
    self, spawn_health_loop, Acceptor, RegionHandler, RegionSession, Snapshot, Unregister,
};
use crate::store::{EtcdBackend, Store, StoreError};
use chrono::Utc;
use futures::future::join_all;
use ironfleet_core::connection::ConnectionEvent;
use ironfleet_core::models::{ControllerIdentity, ControllerKind};
use ironfleet_core::protocol::Event;
use ironfleet_core::version::{self, PROTOCOL_REVISION};
use kameo::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Open the configured store.
pub async fn open_store(config: &RegionConfig) -> Result<Store, StoreError> {
    match config.store {
        StoreKind::Memory => Ok(Store::in_memory()),
        StoreKind::Etcd => {
            let backend = EtcdBackend::connect(&config.etcd).await?;
            Ok(Store::new(Arc::new(backend)))
        }
    }
}

/// A running region controller.
pub struct Region {
    pub local: ControllerIdentity,
    pub store: Store,
    pub election: ActorRef<ElectionCoordinator>,
    pub session: ActorRef<RegionSession>,
    pub engine: LifecycleEngine,
    pub acceptor: Acceptor,
    pub readiness: Arc<AtomicBool>,
    config: RegionConfig,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Region {
    /// Start every component and load stored machines. Racks are accepted
    /// through [`Region::serve`] or by handing transports to `acceptor`.
    pub async fn start(config: RegionConfig, store: Store) -> Result<Self, LifecycleError> {
        let local = ControllerIdentity {
            id: config.region_id,
            kind: ControllerKind::Region,
            name: config.region_name.clone(),
            started_at: Utc::now(),
            version: version::VERSION.to_string(),
            protocol: PROTOCOL_REVISION,
            segments: Vec::new(),
        };
        let shutdown = CancellationToken::new();

        let election = ElectionCoordinator::spawn(ElectionCoordinator::new(
            store.clone(),
            config.election.clone(),
        ));
        let session = RegionSession::spawn(RegionSession::new(
            store.clone(),
            election.clone(),
            config.connection.drain_grace,
        ));

        let engine = LifecycleEngine::new(
            store.clone(),
            RackRouter::new(store.clone(), session.clone()),
            config.lifecycle.clone(),
        );
        engine.start().await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let acceptor = Acceptor {
            local: local.clone(),
            store: store.clone(),
            session: session.clone(),
            handler: Arc::new(RegionHandler::new(
                store.clone(),
                session.clone(),
                config.stop_timeout,
            )),
            events: events_tx,
            config: config.connection.clone(),
            auto_enroll: config.auto_enroll,
        };

        let tasks = vec![
            tokio::spawn(pump_events(
                events_rx,
                session.clone(),
                election.clone(),
                engine.clone(),
                shutdown.clone(),
            )),
            spawn_health_loop(session.clone(), config.health, shutdown.clone()),
        ];

        info!(
            region_id = %local.id,
            region_name = %local.name,
            "Region controller started"
        );

        Ok(Self {
            local,
            store,
            election,
            session,
            engine,
            acceptor,
            readiness: Arc::new(AtomicBool::new(false)),
            config,
            shutdown,
            tasks,
        })
    }

    /// Accept racks on `listener` and mark the region ready.
    pub fn serve(&mut self, listener: TcpListener) {
        let acceptor = self.acceptor.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(session::listener::serve(
            listener, acceptor, shutdown,
        )));
        self.readiness.store(true, Ordering::Release);
    }

    pub fn app_state(&self, metrics_state: Option<MetricsState>) -> AppState {
        AppState {
            store: self.store.clone(),
            session: self.session.clone(),
            election: self.election.clone(),
            engine: self.engine.clone(),
            metrics_state,
            readiness: self.readiness.clone(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting racks and drain every connection.
    pub async fn shutdown(self) {
        self.readiness.store(false, Ordering::Release);
        self.shutdown.cancel();

        if let Ok(snapshot) = self.session.ask(Snapshot).send().await {
            let grace = self.config.connection.drain_grace;
            join_all(snapshot.connections.iter().map(|c| c.drain(grace))).await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "Region task ended abnormally");
            }
        }
        info!(region_id = %self.local.id, "Region controller stopped");
    }
}

/// Route connection events to the session, the election and the engine.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    session: ActorRef<RegionSession>,
    election: ActorRef<ElectionCoordinator>,
    engine: LifecycleEngine,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ConnectionEvent::Closed {
                connection, peer, ..
            } => {
                if let Err(e) = session
                    .tell(Unregister {
                        rack: peer,
                        connection,
                    })
                    .send()
                    .await
                {
                    debug!(rack_id = %peer, error = %e, "Failed to unregister closed connection");
                }
            }
            ConnectionEvent::Draining { connection, peer } => {
                debug!(rack_id = %peer, connection_id = %connection, "Rack is draining");
            }
            ConnectionEvent::Event { peer, event, .. } => match event {
                Event::PowerStateChanged {
                    machine,
                    state,
                    observed_at,
                } => engine.power_observed(machine, state, observed_at).await,
                Event::ServiceStopped { grant, reason } => {
                    debug!(
                        rack_id = %peer,
                        segment_id = %grant.segment,
                        service = %grant.service,
                        reason = %reason,
                        "Rack stopped serving"
                    );
                    if let Err(e) = election
                        .tell(OwnerStopped { rack: peer, grant })
                        .send()
                        .await
                    {
                        debug!(error = %e, "Failed to forward stopped service");
                    }
                }
            },
        }
    }
    debug!("Connection event pump stopped");
}
