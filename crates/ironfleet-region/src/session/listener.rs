//! Rack listener
//!
//! Accepts transports, negotiates identity and registers the resulting
//! connection with the session. The acceptor is transport-agnostic so tests
//! can hand it in-memory duplex streams.

use super::{RegionSession, Register, RegisterError};
use crate::store::{Store, StoreError};
use ironfleet_core::connection::{
    handshake, CallHandler, Connection, ConnectionConfig, EventSink,
};
use ironfleet_core::error::{Classify, ErrorClass, HandshakeError};
use ironfleet_core::models::{ControllerIdentity, ControllerKind, ControllerRecord};
use ironfleet_core::observability::events as core_events;
use kameo::error::SendError;
use kameo::prelude::*;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("connection closed before registration")]
    Closed,
    #[error("session unavailable")]
    SessionUnavailable,
}

impl Classify for AcceptError {
    fn class(&self) -> ErrorClass {
        match self {
            AcceptError::Handshake(e) => e.class(),
            AcceptError::Store(e) => e.class(),
            AcceptError::Closed | AcceptError::SessionUnavailable => ErrorClass::TransientTransport,
        }
    }
}

/// Everything needed to turn a raw transport into a registered connection.
#[derive(Clone)]
pub struct Acceptor {
    pub local: ControllerIdentity,
    pub store: Store,
    pub session: ActorRef<RegionSession>,
    pub handler: Arc<dyn CallHandler>,
    pub events: EventSink,
    pub config: ConnectionConfig,
    /// Create a directory entry for unknown racks instead of refusing them.
    pub auto_enroll: bool,
}

impl Acceptor {
    pub async fn accept<T>(&self, io: T, remote: &str) -> Result<Connection, AcceptError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut transport = handshake::framed(io);
        let hello = match handshake::receive_hello(&mut transport, self.config.handshake_timeout).await {
            Ok(hello) => hello,
            Err(e) => {
                if let HandshakeError::ProtocolMismatch { .. } = e {
                    handshake::reject(&mut transport, &e.to_string()).await;
                    core_events::identity_rejected("unknown", remote, &e.to_string());
                }
                return Err(e.into());
            }
        };

        if let Err(e) = self.verify(&hello).await {
            let reason = e.to_string();
            if e.class() == ErrorClass::FatalIdentity {
                core_events::identity_rejected(&hello.name, remote, &reason);
            }
            handshake::reject(&mut transport, &reason).await;
            return Err(e);
        }

        handshake::welcome(&mut transport, &self.local).await?;

        let connection = Connection::spawn(
            transport,
            self.local.clone(),
            hello,
            self.config.clone(),
            self.handler.clone(),
            self.events.clone(),
        );

        match self
            .session
            .ask(Register {
                connection: connection.clone(),
            })
            .send()
            .await
        {
            Ok(_) => Ok(connection),
            Err(SendError::HandlerError(RegisterError::Unusable(_))) => Err(AcceptError::Closed),
            Err(SendError::HandlerError(RegisterError::Store(e))) => {
                connection.close("registration failed");
                Err(AcceptError::Store(e))
            }
            Err(_) => {
                connection.close("session unavailable");
                Err(AcceptError::SessionUnavailable)
            }
        }
    }

    /// Directory check: the rack must be known and not revoked.
    async fn verify(&self, hello: &ControllerIdentity) -> Result<(), AcceptError> {
        if hello.kind != ControllerKind::Rack {
            return Err(HandshakeError::KindMismatch {
                expected: ControllerKind::Rack.to_string(),
                announced: hello.kind.to_string(),
            }
            .into());
        }

        match self.store.get_controller(&hello.id).await? {
            Some(record) if record.revoked => {
                Err(HandshakeError::Revoked(hello.id.to_string()).into())
            }
            Some(_) => Ok(()),
            None if self.auto_enroll => {
                info!(rack_id = %hello.id, rack_name = %hello.name, "Enrolling new rack controller");
                let record = ControllerRecord::new(hello.id, ControllerKind::Rack, hello.name.clone());
                self.store.put_controller(&record).await?;
                Ok(())
            }
            None => Err(HandshakeError::UnknownController(hello.id.to_string()).into()),
        }
    }
}

/// Accept rack connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, acceptor: Acceptor, shutdown: CancellationToken) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept rack connection");
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "Failed to set TCP_NODELAY");
        }

        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let remote = remote.to_string();
            if let Err(e) = acceptor.accept(stream, &remote).await {
                warn!(remote = %remote, error = %e, "Rack connection refused");
            }
        });
    }
    debug!("Rack listener stopped");
}
