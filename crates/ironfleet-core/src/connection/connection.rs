//! Established connection
//!
//! After identity negotiation the framed transport is split into a reader
//! task and a writer task. Outbound frames reach the writer through an
//! unbounded channel; responses are matched to waiting callers by sequence
//! number; inbound requests are served concurrently by a [`CallHandler`].

use super::handshake::FramedTransport;
use super::stats::CallStats;
use super::window::{TimeoutPolicy, TimeoutWindow};
use crate::error::{CallError, ErrorClass, RemoteError};
use crate::ids::{ConnectionId, ControllerId};
use crate::models::{ConnectionHealth, ControllerIdentity, ControllerKind};
use crate::observability::{events, metrics};
use crate::protocol::{Event, Frame, Reply, Request};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub handshake_timeout: Duration,
    /// Deadline used by [`Connection::call_default`].
    pub call_timeout: Duration,
    pub timeouts: TimeoutPolicy,
    pub drain_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            timeouts: TimeoutPolicy::default(),
            drain_grace: Duration::from_secs(10),
        }
    }
}

/// Who sent an inbound request.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub connection: ConnectionId,
    pub peer: ControllerIdentity,
}

/// Serves requests arriving from the peer.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: CallContext, request: Request) -> Result<Reply, RemoteError>;
}

/// Lifecycle notifications delivered to the owning session.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Unsolicited event pushed by the peer.
    Event {
        connection: ConnectionId,
        peer: ControllerId,
        event: Event,
    },
    /// Peer announced it is draining.
    Draining {
        connection: ConnectionId,
        peer: ControllerId,
    },
    /// Terminal; sent exactly once per connection.
    Closed {
        connection: ConnectionId,
        peer: ControllerId,
        reason: String,
    },
}

pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

/// Snapshot of a connection for registries and the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: ControllerId,
    pub peer_name: String,
    pub peer_kind: ControllerKind,
    pub established_at: DateTime<Utc>,
    pub health: ConnectionHealth,
    pub rtt_ms: Option<f64>,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub score: f64,
}

type PendingSlot = oneshot::Sender<Result<Reply, RemoteError>>;

struct Shared {
    id: ConnectionId,
    local: ControllerIdentity,
    peer: ControllerIdentity,
    established_at: DateTime<Utc>,
    config: ConnectionConfig,
    outbound: mpsc::UnboundedSender<Frame>,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSlot>>,
    inbound_in_flight: AtomicUsize,
    idle: Notify,
    health: watch::Sender<ConnectionHealth>,
    stats: Mutex<CallStats>,
    timeouts: Mutex<TimeoutWindow>,
    shutdown: CancellationToken,
    events: EventSink,
}

/// Cheap handle to one live rack↔region connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer.id)
            .field("health", &self.health())
            .finish()
    }
}

impl Connection {
    /// Start the reader and writer tasks over a negotiated transport.
    pub fn spawn<T>(
        transport: FramedTransport<T>,
        local: ControllerIdentity,
        peer: ControllerIdentity,
        config: ConnectionConfig,
        handler: Arc<dyn CallHandler>,
        events: EventSink,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (health, _) = watch::channel(ConnectionHealth::Established);
        let shared = Arc::new(Shared {
            id: ConnectionId::new(),
            local,
            peer,
            established_at: Utc::now(),
            timeouts: Mutex::new(TimeoutWindow::new(config.timeouts)),
            config,
            outbound,
            next_seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            inbound_in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            health,
            stats: Mutex::new(CallStats::default()),
            shutdown: CancellationToken::new(),
            events,
        });

        let connection = Connection { shared };
        let (sink, stream) = transport.split();
        tokio::spawn(write_loop(connection.clone(), sink, outbound_rx));
        tokio::spawn(read_loop(connection.clone(), stream, handler));

        events::connection_established(
            &connection.shared.id,
            &connection.shared.peer.id,
            &connection.shared.peer.name,
            connection.shared.peer.kind,
        );
        metrics::record_connection_opened(connection.shared.local.kind);

        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer(&self) -> &ControllerIdentity {
        &self.shared.peer
    }

    pub fn local(&self) -> &ControllerIdentity {
        &self.shared.local
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.shared.established_at
    }

    pub fn health(&self) -> ConnectionHealth {
        *self.shared.health.borrow()
    }

    pub fn is_usable(&self) -> bool {
        self.health() == ConnectionHealth::Established
    }

    /// Subscribe to health transitions.
    pub fn watch_health(&self) -> watch::Receiver<ConnectionHealth> {
        self.shared.health.subscribe()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    pub fn score(&self) -> f64 {
        lock(&self.shared.stats).score()
    }

    pub fn info(&self) -> ConnectionInfo {
        let stats = lock(&self.shared.stats).clone();
        ConnectionInfo {
            id: self.shared.id,
            peer: self.shared.peer.id,
            peer_name: self.shared.peer.name.clone(),
            peer_kind: self.shared.peer.kind,
            established_at: self.shared.established_at,
            health: self.health(),
            rtt_ms: stats.smoothed_rtt().map(|d| d.as_secs_f64() * 1000.0),
            consecutive_errors: stats.consecutive_errors(),
            total_errors: stats.total_errors(),
            score: stats.score(),
        }
    }

    /// Outbound calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Call with the connection's default deadline.
    pub async fn call_default(&self, request: Request) -> Result<Reply, CallError> {
        self.call(request, self.shared.config.call_timeout).await
    }

    /// Send a request and wait for its response or the deadline.
    pub async fn call(&self, request: Request, deadline: Duration) -> Result<Reply, CallError> {
        match self.health() {
            ConnectionHealth::Established => {}
            ConnectionHealth::Draining => return Err(CallError::Draining),
            ConnectionHealth::Connecting | ConnectionHealth::Closed => {
                return Err(CallError::Closed)
            }
        }

        let op = request.op();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(seq, tx);

        let frame = Frame::Request {
            seq,
            deadline_ms: deadline.as_millis().min(u64::MAX as u128) as u64,
            body: request,
        };
        if self.shared.outbound.send(frame).is_err() {
            self.take_pending(seq);
            return Err(CallError::Closed);
        }

        trace!(connection_id = %self.shared.id, seq, op, "Call sent");
        let started = Instant::now();
        let outcome = tokio::time::timeout(deadline, rx).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(Ok(reply))) => {
                lock(&self.shared.stats).record_success(elapsed);
                Ok(reply)
            }
            Ok(Ok(Err(remote))) => {
                // The transport worked; the failure belongs to the remote operation.
                lock(&self.shared.stats).record_success(elapsed);
                Err(CallError::Remote(remote))
            }
            Ok(Err(_)) => {
                lock(&self.shared.stats).record_error();
                Err(CallError::Closed)
            }
            Err(_) => {
                self.take_pending(seq);
                lock(&self.shared.stats).record_error();
                let exhausted = lock(&self.shared.timeouts).record();
                warn!(
                    connection_id = %self.shared.id,
                    peer = %self.shared.peer.name,
                    seq,
                    op,
                    deadline_ms = deadline.as_millis() as u64,
                    "Call timed out"
                );
                if exhausted {
                    self.close("too many call timeouts");
                }
                Err(CallError::Timeout {
                    seq,
                    after: deadline,
                })
            }
        };

        metrics::record_call(op, &result, elapsed);
        self.shared.idle.notify_one();
        result
    }

    /// Push an unsolicited event to the peer.
    pub fn send_event(&self, event: Event) -> Result<(), CallError> {
        if self.health() == ConnectionHealth::Closed {
            return Err(CallError::Closed);
        }
        self.shared
            .outbound
            .send(Frame::Event { event })
            .map_err(|_| CallError::Closed)
    }

    /// Graceful half-close: stop issuing calls, let in-flight work finish
    /// (bounded by `grace`), then say goodbye and close.
    pub async fn drain(&self, grace: Duration) {
        let changed = self.shared.health.send_if_modified(|health| {
            if *health == ConnectionHealth::Established {
                *health = ConnectionHealth::Draining;
                true
            } else {
                false
            }
        });
        if !changed && self.health() == ConnectionHealth::Closed {
            return;
        }
        if changed {
            debug!(connection_id = %self.shared.id, peer = %self.shared.peer.name, "Draining connection");
            let _ = self.shared.outbound.send(Frame::Drain);
        }

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.shared.idle.notified();
            if self.is_idle() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    connection_id = %self.shared.id,
                    pending = self.pending_calls(),
                    inbound = self.shared.inbound_in_flight.load(Ordering::SeqCst),
                    "Drain grace expired with work in flight"
                );
                break;
            }
        }

        // The writer closes the connection once Goodbye is flushed.
        if self.shared.outbound.send(Frame::Goodbye).is_err() {
            self.close("drained");
            return;
        }
        if tokio::time::timeout(Duration::from_secs(1), self.closed())
            .await
            .is_err()
        {
            self.close("drained");
        }
    }

    /// Close immediately. Idempotent; only the first call has any effect.
    pub fn close(&self, reason: &str) {
        let changed = self.shared.health.send_if_modified(|health| {
            if *health == ConnectionHealth::Closed {
                false
            } else {
                *health = ConnectionHealth::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        self.shared.shutdown.cancel();
        // Dropping the senders fails every waiting caller with `Closed`.
        let abandoned: Vec<_> = lock(&self.shared.pending).drain().collect();
        drop(abandoned);
        self.shared.idle.notify_one();

        events::connection_closed(&self.shared.id, &self.shared.peer.id, &self.shared.peer.name, reason);
        metrics::record_connection_closed(self.shared.local.kind);

        let _ = self.shared.events.send(ConnectionEvent::Closed {
            connection: self.shared.id,
            peer: self.shared.peer.id,
            reason: reason.to_string(),
        });
    }

    fn is_idle(&self) -> bool {
        lock(&self.shared.pending).is_empty()
            && self.shared.inbound_in_flight.load(Ordering::SeqCst) == 0
    }

    fn take_pending(&self, seq: u64) -> Option<PendingSlot> {
        lock(&self.shared.pending).remove(&seq)
    }

    fn peer_draining(&self) {
        let changed = self.shared.health.send_if_modified(|health| {
            if *health == ConnectionHealth::Established {
                *health = ConnectionHealth::Draining;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(connection_id = %self.shared.id, peer = %self.shared.peer.name, "Peer is draining");
            let _ = self.shared.events.send(ConnectionEvent::Draining {
                connection: self.shared.id,
                peer: self.shared.peer.id,
            });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn write_loop<T>(
    connection: Connection,
    mut sink: SplitSink<FramedTransport<T>, Frame>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let shutdown = connection.shared.shutdown.clone();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let goodbye = matches!(frame, Frame::Goodbye);

        if let Err(e) = sink.send(frame).await {
            connection.close(&format!("write failed: {e}"));
            break;
        }
        if goodbye {
            let _ = sink.close().await;
            connection.close("drained");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<T>(
    connection: Connection,
    mut stream: SplitStream<FramedTransport<T>>,
    handler: Arc<dyn CallHandler>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let shutdown = connection.shared.shutdown.clone();
    let reason = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break format!("read failed: {e}"),
            None => break "peer closed the transport".to_string(),
        };

        match frame {
            Frame::Response { seq, result } => match connection.take_pending(seq) {
                Some(slot) => {
                    let _ = slot.send(result);
                }
                None => {
                    debug!(connection_id = %connection.shared.id, seq, "Dropping response for unknown or expired call");
                }
            },
            Frame::Request {
                seq,
                deadline_ms,
                body,
            } => serve_request(&connection, &handler, seq, deadline_ms, body),
            Frame::Event { event } => {
                let _ = connection.shared.events.send(ConnectionEvent::Event {
                    connection: connection.shared.id,
                    peer: connection.shared.peer.id,
                    event,
                });
            }
            Frame::Drain => connection.peer_draining(),
            Frame::Goodbye => break "peer said goodbye".to_string(),
            Frame::Hello(_) | Frame::Welcome(_) | Frame::Rejected { .. } => {
                break "handshake frame on established connection".to_string()
            }
        }
    };

    connection.close(&reason);
}

fn serve_request(
    connection: &Connection,
    handler: &Arc<dyn CallHandler>,
    seq: u64,
    deadline_ms: u64,
    body: Request,
) {
    let connection = connection.clone();
    let handler = Arc::clone(handler);
    connection
        .shared
        .inbound_in_flight
        .fetch_add(1, Ordering::SeqCst);

    tokio::spawn(async move {
        let ctx = CallContext {
            connection: connection.shared.id,
            peer: connection.shared.peer.clone(),
        };
        let op = body.op();
        let deadline = Duration::from_millis(deadline_ms);
        let result = match tokio::time::timeout(deadline, handler.handle(ctx, body)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::new(
                ErrorClass::TransientTransport,
                format!("{op} exceeded its {deadline_ms}ms deadline"),
            )),
        };

        // A response after the caller gave up is harmless; it is dropped on arrival.
        let _ = connection.shared.outbound.send(Frame::Response { seq, result });
        connection
            .shared
            .inbound_in_flight
            .fetch_sub(1, Ordering::SeqCst);
        connection.shared.idle.notify_one();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::handshake::framed;
    use crate::version::PROTOCOL_REVISION;

    fn identity(kind: ControllerKind, name: &str) -> ControllerIdentity {
        ControllerIdentity {
            id: ControllerId::new(),
            kind,
            name: name.to_string(),
            started_at: Utc::now(),
            version: "test".to_string(),
            protocol: PROTOCOL_REVISION,
            segments: Vec::new(),
        }
    }

    /// Answers pings after an optional delay.
    struct PingHandler {
        delay: Duration,
    }

    #[async_trait]
    impl CallHandler for PingHandler {
        async fn handle(&self, _ctx: CallContext, request: Request) -> Result<Reply, RemoteError> {
            tokio::time::sleep(self.delay).await;
            match request {
                Request::Ping { sent_at } => Ok(Reply::Pong { sent_at }),
                other => Err(RemoteError::unsupported(other)),
            }
        }
    }

    struct Pair {
        region: Connection,
        rack: Connection,
        region_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        rack_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    fn pair(config: ConnectionConfig, rack_delay: Duration) -> Pair {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let region_identity = identity(ControllerKind::Region, "region-1");
        let rack_identity = identity(ControllerKind::Rack, "rack-a");
        let (region_tx, region_events) = mpsc::unbounded_channel();
        let (rack_tx, rack_events) = mpsc::unbounded_channel();

        let region = Connection::spawn(
            framed(a),
            region_identity.clone(),
            rack_identity.clone(),
            config.clone(),
            Arc::new(PingHandler {
                delay: Duration::ZERO,
            }),
            region_tx,
        );
        let rack = Connection::spawn(
            framed(b),
            rack_identity,
            region_identity,
            config,
            Arc::new(PingHandler { delay: rack_delay }),
            rack_tx,
        );
        Pair {
            region,
            rack,
            region_events,
            rack_events,
        }
    }

    fn ping() -> Request {
        Request::Ping {
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_call_is_answered() {
        let pair = pair(ConnectionConfig::default(), Duration::ZERO);
        let sent_at = Utc::now();
        let reply = pair
            .region
            .call(Request::Ping { sent_at }, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Pong { sent_at });
        assert_eq!(pair.region.pending_calls(), 0);
        assert!(pair.region.info().rtt_ms.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_correlated() {
        let pair = pair(ConnectionConfig::default(), Duration::from_millis(5));
        let base = Utc::now();
        let calls = (0..16).map(|i| {
            let conn = pair.rack.clone();
            let sent_at = base + chrono::Duration::milliseconds(i);
            async move {
                let reply = conn
                    .call(Request::Ping { sent_at }, Duration::from_secs(5))
                    .await
                    .unwrap();
                (sent_at, reply)
            }
        });
        for (sent_at, reply) in futures::future::join_all(calls).await {
            assert_eq!(reply, Reply::Pong { sent_at });
        }
    }

    #[tokio::test]
    async fn test_remote_error_is_returned_not_fatal() {
        let pair = pair(ConnectionConfig::default(), Duration::ZERO);
        let err = pair
            .region
            .call(
                Request::ReportServing { grants: Vec::new() },
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Remote(_)));
        assert!(pair.region.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_budget_closes_connection_once() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        // The peer reads nothing and never answers.
        let _silent = framed(b);
        let (tx, mut events) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            timeouts: TimeoutPolicy::new(2, Duration::from_secs(60)),
            ..Default::default()
        };
        let conn = Connection::spawn(
            framed(a),
            identity(ControllerKind::Region, "region-1"),
            identity(ControllerKind::Rack, "rack-a"),
            config,
            Arc::new(PingHandler {
                delay: Duration::ZERO,
            }),
            tx,
        );

        let first = conn.call(ping(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(first, CallError::Timeout { seq: 1, .. }));
        assert!(conn.is_usable());

        let second = conn.call(ping(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(second, CallError::Timeout { seq: 2, .. }));
        assert_eq!(conn.health(), ConnectionHealth::Closed);

        assert_eq!(
            conn.call(ping(), Duration::from_secs(1)).await.unwrap_err(),
            CallError::Closed
        );

        conn.close("again");
        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectionEvent::Closed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_drain_lets_in_flight_call_finish() {
        let mut pair = pair(ConnectionConfig::default(), Duration::from_millis(50));
        let region = pair.region.clone();

        let (reply, ()) = tokio::join!(
            region.call(ping(), Duration::from_secs(5)),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                pair.region.drain(Duration::from_secs(2)).await;
            }
        );

        assert!(matches!(reply, Ok(Reply::Pong { .. })));
        assert_eq!(pair.region.health(), ConnectionHealth::Closed);

        tokio::time::timeout(Duration::from_secs(2), pair.rack.closed())
            .await
            .unwrap();

        let first = pair.rack_events.recv().await.unwrap();
        assert!(matches!(first, ConnectionEvent::Draining { .. }));
        let second = pair.rack_events.recv().await.unwrap();
        assert!(matches!(second, ConnectionEvent::Closed { .. }));

        let region_closed = pair.region_events.recv().await.unwrap();
        assert!(matches!(region_closed, ConnectionEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_draining_peer_refuses_new_calls() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let mut raw = framed(b);
        let (tx, _events) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            framed(a),
            identity(ControllerKind::Rack, "rack-a"),
            identity(ControllerKind::Region, "region-1"),
            ConnectionConfig::default(),
            Arc::new(PingHandler {
                delay: Duration::ZERO,
            }),
            tx,
        );

        raw.send(Frame::Drain).await.unwrap();
        let mut health = conn.watch_health();
        tokio::time::timeout(
            Duration::from_secs(2),
            health.wait_for(|h| *h == ConnectionHealth::Draining),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            conn.call(ping(), Duration::from_secs(1)).await.unwrap_err(),
            CallError::Draining
        );
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let mut raw = framed(b);
        let (tx, _events) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            framed(a),
            identity(ControllerKind::Rack, "rack-a"),
            identity(ControllerKind::Region, "region-1"),
            ConnectionConfig::default(),
            Arc::new(PingHandler {
                delay: Duration::ZERO,
            }),
            tx,
        );

        raw.send(Frame::Response {
            seq: 999,
            result: Ok(Reply::Ack),
        })
        .await
        .unwrap();

        // The connection keeps serving after the stray response.
        raw.send(Frame::Request {
            seq: 1,
            deadline_ms: 1_000,
            body: ping(),
        })
        .await
        .unwrap();
        let answer = tokio::time::timeout(Duration::from_secs(2), raw.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(
            answer,
            Frame::Response {
                seq: 1,
                result: Ok(Reply::Pong { .. })
            }
        ));
        assert!(conn.is_usable());
    }

    #[tokio::test]
    async fn test_peer_events_reach_the_sink() {
        let mut pair = pair(ConnectionConfig::default(), Duration::ZERO);
        let machine = crate::ids::MachineId::new();
        pair.rack
            .send_event(Event::PowerStateChanged {
                machine,
                state: crate::models::PowerState::On,
                observed_at: Utc::now(),
            })
            .unwrap();

        let event = pair.region_events.recv().await.unwrap();
        match event {
            ConnectionEvent::Event {
                event: Event::PowerStateChanged { machine: m, .. },
                ..
            } => assert_eq!(m, machine),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
