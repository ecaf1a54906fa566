//! Region session
//!
//! The rack keeps one connection to every configured region address. A single
//! supervisor task owns the registry: it dials missing addresses round-robin
//! under a shared exponential backoff, reacts to connections closing, and
//! forwards agent events to the preferred region. Dials run as their own
//! tasks so a slow handshake never stalls the supervisor.
//!
//! Rules:
//! - a successful establishment resets the backoff
//! - an address whose region refused our identity is parked until restart
//! - losing the region that granted a service drops that grant at once

pub mod connector;
pub mod ping;
pub mod selection;

use crate::observability::{events, metrics};
use crate::services::ServiceHost;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use ironfleet_core::connection::{
    handshake, CallHandler, Connection, ConnectionConfig, ConnectionEvent, ConnectionInfo,
};
use ironfleet_core::error::{CallError, Classify, ErrorClass, HandshakeError};
use ironfleet_core::ids::ConnectionId;
use ironfleet_core::models::ControllerIdentity;
use ironfleet_core::protocol::{Event, Reply, Request};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use connector::{BoxedTransport, Connector, TcpConnector, Transport};
pub use ping::PingConfig;

/// Bounds for re-dialing regions.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of each delay randomized in either direction.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl ReconnectPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            randomization_factor: self.jitter,
            multiplier: self.multiplier,
            max_interval: self.max,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub regions: Vec<String>,
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectPolicy,
    pub ping: PingConfig,
    /// Connections tried per outbound call before giving up.
    pub call_attempts: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            connection: ConnectionConfig::default(),
            reconnect: ReconnectPolicy::default(),
            ping: PingConfig::default(),
            call_attempts: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("connect to {address} timed out")]
    ConnectTimeout { address: String },
    #[error("handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        source: HandshakeError,
    },
}

impl Classify for EstablishError {
    fn class(&self) -> ErrorClass {
        match self {
            EstablishError::Connect { .. } | EstablishError::ConnectTimeout { .. } => {
                ErrorClass::TransientTransport
            }
            EstablishError::Handshake { source, .. } => source.class(),
        }
    }
}

/// Where things are dialed from and who answers the region's calls.
pub struct SessionDeps {
    pub local: ControllerIdentity,
    pub connector: Arc<dyn Connector>,
    pub handler: Arc<dyn CallHandler>,
    pub services: Arc<ServiceHost>,
    /// Events raised by the agent, forwarded to the preferred region.
    pub outbox: mpsc::UnboundedReceiver<Event>,
}

struct Inner {
    local: ControllerIdentity,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn CallHandler>,
    services: Arc<ServiceHost>,
    /// Written only by the supervisor task.
    connections: RwLock<HashMap<String, Connection>>,
    refused: RwLock<HashMap<String, String>>,
    shutdown: CancellationToken,
}

/// Handle to the rack's set of region connections.
#[derive(Clone)]
pub struct RackSession {
    inner: Arc<Inner>,
    supervisor: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl RackSession {
    /// Start the supervisor. Connections are made in the background.
    pub fn start(config: SessionConfig, deps: SessionDeps) -> Self {
        let SessionDeps {
            local,
            connector,
            handler,
            services,
            outbox,
        } = deps;

        let inner = Arc::new(Inner {
            local,
            config,
            connector,
            handler,
            services,
            connections: RwLock::new(HashMap::new()),
            refused: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        info!(
            rack_id = %inner.local.id,
            regions = inner.config.regions.len(),
            "Starting region session"
        );

        let task = tokio::spawn(supervise(Arc::clone(&inner), outbox));
        Self {
            inner,
            supervisor: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }

    pub fn local(&self) -> &ControllerIdentity {
        &self.inner.local
    }

    /// Snapshot of the live connections, keyed by region address.
    pub async fn connections(&self) -> HashMap<String, ConnectionInfo> {
        self.inner
            .connections
            .read()
            .await
            .iter()
            .map(|(address, conn)| (address.clone(), conn.info()))
            .collect()
    }

    /// Addresses parked after an identity refusal, with the reason.
    pub async fn refused(&self) -> HashMap<String, String> {
        self.inner.refused.read().await.clone()
    }

    /// Best usable connection right now.
    pub async fn preferred(&self) -> Option<Connection> {
        self.inner.ranked().await.into_iter().next()
    }

    /// Call any region, best connection first, failing over on connection faults.
    pub async fn call(&self, request: Request, deadline: Duration) -> Result<Reply, CallError> {
        self.inner.call(request, deadline).await
    }

    pub async fn send_event(&self, event: Event) -> Result<(), CallError> {
        self.inner.send_event(event).await
    }

    /// Stop dialing and drain every connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let task = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let connections: Vec<_> = self.inner.connections.write().await.drain().collect();
        let grace = self.inner.config.connection.drain_grace;
        futures::future::join_all(connections.iter().map(|(_, conn)| conn.drain(grace))).await;
        for (_, conn) in &connections {
            self.inner.services.connection_lost(conn.id());
        }
        info!(rack_id = %self.inner.local.id, "Region session stopped");
    }
}

impl Inner {
    async fn ranked(&self) -> Vec<Connection> {
        let connections: Vec<_> = self.connections.read().await.values().cloned().collect();
        selection::rank(connections)
    }

    async fn call(&self, request: Request, deadline: Duration) -> Result<Reply, CallError> {
        let candidates = self.ranked().await;
        if candidates.is_empty() {
            return Err(CallError::NoConnection);
        }

        let mut last_error = CallError::NoConnection;
        for conn in candidates.into_iter().take(self.config.call_attempts.max(1)) {
            match conn.call(request.clone(), deadline).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_connection_fault() => {
                    debug!(
                        region = %conn.peer().name,
                        op = request.op(),
                        error = %e,
                        "Call failed on connection, trying next region"
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn send_event(&self, event: Event) -> Result<(), CallError> {
        let mut last_error = CallError::NoConnection;
        for conn in self.ranked().await {
            match conn.send_event(event.clone()) {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    /// Next address that needs a connection, starting after `cursor`.
    async fn next_target(
        &self,
        cursor: &mut usize,
        dialing: &HashMap<task::Id, String>,
    ) -> Option<String> {
        let regions = &self.config.regions;
        if regions.is_empty() {
            return None;
        }
        let connections = self.connections.read().await;
        let refused = self.refused.read().await;
        for _ in 0..regions.len() {
            let address = &regions[*cursor % regions.len()];
            *cursor = (*cursor + 1) % regions.len();
            if !connections.contains_key(address)
                && !refused.contains_key(address)
                && !dialing.values().any(|dialed| dialed == address)
            {
                return Some(address.clone());
            }
        }
        None
    }

    async fn establish(
        &self,
        address: &str,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Connection, EstablishError> {
        let timeout = self.config.connection.handshake_timeout;
        let io = match tokio::time::timeout(timeout, self.connector.connect(address)).await {
            Ok(Ok(io)) => io,
            Ok(Err(source)) => {
                return Err(EstablishError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(EstablishError::ConnectTimeout {
                    address: address.to_string(),
                })
            }
        };

        let mut transport = handshake::framed(io);
        let peer = handshake::initiate(&mut transport, &self.local, timeout)
            .await
            .map_err(|source| EstablishError::Handshake {
                address: address.to_string(),
                source,
            })?;

        Ok(Connection::spawn(
            transport,
            self.local.clone(),
            peer,
            self.config.connection.clone(),
            Arc::clone(&self.handler),
            events.clone(),
        ))
    }

    async fn address_of(&self, connection: ConnectionId) -> Option<String> {
        self.connections
            .read()
            .await
            .iter()
            .find(|(_, conn)| conn.id() == connection)
            .map(|(address, _)| address.clone())
    }

    async fn on_closed(&self, connection: ConnectionId, reason: &str) {
        if let Some(address) = self.address_of(connection).await {
            self.connections.write().await.remove(&address);
            info!(address = %address, reason = %reason, "Region connection lost");
        }

        for grant in self.services.connection_lost(connection) {
            let event = Event::ServiceStopped {
                grant,
                reason: "granting region connection lost".to_string(),
            };
            if let Err(e) = self.send_event(event).await {
                debug!(segment_id = %grant.segment, service = %grant.service, error = %e, "No region to report self-demotion to");
            }
        }
    }
}

/// Result of one background dial.
struct Dialed {
    address: String,
    result: Result<Connection, EstablishError>,
}

async fn supervise(inner: Arc<Inner>, mut outbox: mpsc::UnboundedReceiver<Event>) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut backoff = inner.config.reconnect.backoff();
    let mut cursor = 0usize;
    // Far enough out to mean "nothing to dial until something closes".
    let idle = Duration::from_secs(3600);
    let mut next_attempt = Instant::now();
    let mut outbox_open = true;
    let mut dials: JoinSet<Dialed> = JoinSet::new();
    let mut dialing: HashMap<task::Id, String> = HashMap::new();

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,

            Some(event) = events_rx.recv() => match event {
                ConnectionEvent::Closed { connection, reason, .. } => {
                    inner.on_closed(connection, &reason).await;
                    next_attempt = Instant::now();
                }
                ConnectionEvent::Draining { peer, .. } => {
                    debug!(region_id = %peer, "Region is draining");
                }
                ConnectionEvent::Event { peer, event, .. } => {
                    debug!(region_id = %peer, event = ?event, "Ignoring event from region");
                }
            },

            event = outbox.recv(), if outbox_open => match event {
                Some(event) => {
                    if let Err(e) = inner.send_event(event).await {
                        warn!(error = %e, "Dropping rack event, no region connected");
                    }
                }
                None => outbox_open = false,
            },

            Some(joined) = dials.join_next_with_id() => {
                let Dialed { address, result } = match joined {
                    Ok((id, dialed)) => {
                        dialing.remove(&id);
                        dialed
                    }
                    Err(e) => {
                        let address = dialing.remove(&e.id()).unwrap_or_default();
                        warn!(address = %address, error = %e, "Region dial task failed");
                        next_attempt = Instant::now();
                        continue;
                    }
                };

                match result {
                    Ok(conn) if !conn.is_usable() => {
                        debug!(address = %address, "Region connection closed before it was registered");
                        next_attempt = Instant::now();
                    }
                    Ok(conn) => {
                        metrics::record_reconnect_attempt("ok");
                        info!(
                            address = %address,
                            region = %conn.peer().name,
                            region_id = %conn.peer().id,
                            "Region connection established"
                        );
                        backoff.reset();
                        ping::spawn_ping_loop(conn.clone(), Arc::clone(&inner.services), inner.config.ping);
                        inner.connections.write().await.insert(address, conn);
                        next_attempt = Instant::now();
                    }
                    Err(e) if e.class() == ErrorClass::FatalIdentity => {
                        metrics::record_reconnect_attempt("refused");
                        events::region_address_refused(&address, &e.to_string());
                        inner.refused.write().await.insert(address, e.to_string());
                        next_attempt = Instant::now();
                    }
                    Err(e) => {
                        metrics::record_reconnect_attempt("failed");
                        let delay = backoff.next_backoff().unwrap_or(inner.config.reconnect.max);
                        events::region_connect_failed(&address, &e.to_string(), delay);
                        next_attempt = Instant::now() + delay;
                    }
                }
            },

            _ = tokio::time::sleep_until(next_attempt) => {
                let Some(address) = inner.next_target(&mut cursor, &dialing).await else {
                    next_attempt = Instant::now() + idle;
                    continue;
                };

                debug!(address = %address, "Dialing region");
                let dialer = Arc::clone(&inner);
                let events = events_tx.clone();
                let target = address.clone();
                let handle = dials.spawn(async move {
                    let result = dialer.establish(&target, &events).await;
                    Dialed { address: target, result }
                });
                dialing.insert(handle.id(), address);
                next_attempt = Instant::now();
            }
        }
    }

    // A dial that finished after the last poll must not leave a live connection behind.
    dials.abort_all();
    while let Some(joined) = dials.join_next().await {
        if let Ok(Dialed { result: Ok(conn), .. }) = joined {
            conn.close("session stopped");
        }
    }
    debug!("Region session supervisor stopped");
}
