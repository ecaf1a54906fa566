//! Identity negotiation
//!
//! The rack speaks first with `Hello`. The region answers `Welcome` with its
//! own identity, or `Rejected` and closes. Both sides bound the exchange with
//! a timeout.

use crate::error::HandshakeError;
use crate::models::{ControllerIdentity, ControllerKind};
use crate::protocol::{Frame, FrameCodec};
use crate::version::PROTOCOL_REVISION;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// Framed transport before and after identity negotiation.
pub type FramedTransport<T> = Framed<T, FrameCodec>;

pub fn framed<T>(io: T) -> FramedTransport<T>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, FrameCodec::new())
}

/// Rack side: announce our identity and wait for the region's verdict.
pub async fn initiate<T>(
    transport: &mut FramedTransport<T>,
    local: &ControllerIdentity,
    timeout: Duration,
) -> Result<ControllerIdentity, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, hello_exchange(transport, local))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn hello_exchange<T>(
    transport: &mut FramedTransport<T>,
    local: &ControllerIdentity,
) -> Result<ControllerIdentity, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport
        .send(Frame::Hello(local.clone()))
        .await
        .map_err(|e| HandshakeError::Transport(e.to_string()))?;

    match next_frame(transport).await? {
        Frame::Welcome(peer) => {
            if peer.kind != ControllerKind::Region {
                return Err(HandshakeError::KindMismatch {
                    expected: ControllerKind::Region.to_string(),
                    announced: peer.kind.to_string(),
                });
            }
            Ok(peer)
        }
        Frame::Rejected { reason } => Err(HandshakeError::Rejected(reason)),
        other => Err(HandshakeError::UnexpectedFrame(frame_name(&other))),
    }
}

/// Region side: read the peer's `Hello`. The caller decides whether to
/// [`welcome`] or [`reject`] it.
pub async fn receive_hello<T>(
    transport: &mut FramedTransport<T>,
    timeout: Duration,
) -> Result<ControllerIdentity, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::time::timeout(timeout, next_frame(transport))
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    let identity = match frame {
        Frame::Hello(identity) => identity,
        other => return Err(HandshakeError::UnexpectedFrame(frame_name(&other))),
    };

    if identity.protocol != PROTOCOL_REVISION {
        return Err(HandshakeError::ProtocolMismatch {
            ours: PROTOCOL_REVISION,
            theirs: identity.protocol,
        });
    }

    Ok(identity)
}

pub async fn welcome<T>(
    transport: &mut FramedTransport<T>,
    local: &ControllerIdentity,
) -> Result<(), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport
        .send(Frame::Welcome(local.clone()))
        .await
        .map_err(|e| HandshakeError::Transport(e.to_string()))
}

/// Tell the peer why it was refused, then close the transport.
pub async fn reject<T>(transport: &mut FramedTransport<T>, reason: &str)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let _ = transport
        .send(Frame::Rejected {
            reason: reason.to_string(),
        })
        .await;
    let _ = transport.close().await;
}

async fn next_frame<T>(transport: &mut FramedTransport<T>) -> Result<Frame, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match transport.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(HandshakeError::Transport(e.to_string())),
        None => Err(HandshakeError::Transport(
            "peer closed during handshake".to_string(),
        )),
    }
}

fn frame_name(frame: &Frame) -> String {
    match frame {
        Frame::Hello(_) => "hello",
        Frame::Welcome(_) => "welcome",
        Frame::Rejected { .. } => "rejected",
        Frame::Request { .. } => "request",
        Frame::Response { .. } => "response",
        Frame::Event { .. } => "event",
        Frame::Drain => "drain",
        Frame::Goodbye => "goodbye",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ControllerId;
    use chrono::Utc;

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

    #[tokio::test]
    async fn test_welcome_completes_handshake() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut rack = framed(a);
        let mut region = framed(b);
        let rack_id = identity(ControllerKind::Rack, "rack-a");
        let region_id = identity(ControllerKind::Region, "region-1");

        let server = {
            let region_id = region_id.clone();
            tokio::spawn(async move {
                let hello = receive_hello(&mut region, Duration::from_secs(1)).await?;
                welcome(&mut region, &region_id).await?;
                Ok::<_, HandshakeError>(hello)
            })
        };

        let peer = initiate(&mut rack, &rack_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(peer.id, region_id.id);
        assert_eq!(server.await.unwrap().unwrap().id, rack_id.id);
    }

    #[tokio::test]
    async fn test_rejection_is_fatal_identity() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut rack = framed(a);
        let mut region = framed(b);

        tokio::spawn(async move {
            let _ = receive_hello(&mut region, Duration::from_secs(1)).await;
            reject(&mut region, "unknown controller").await;
        });

        let err = initiate(
            &mut rack,
            &identity(ControllerKind::Rack, "rack-x"),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err, HandshakeError::Rejected("unknown controller".into()));
    }

    #[tokio::test]
    async fn test_protocol_mismatch_is_detected() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut rack = framed(a);
        let mut region = framed(b);

        let mut old = identity(ControllerKind::Rack, "rack-old");
        old.protocol = PROTOCOL_REVISION + 1;
        rack.send(Frame::Hello(old)).await.unwrap();

        let err = receive_hello(&mut region, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::ProtocolMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (_a, b) = tokio::io::duplex(64 * 1024);
        let mut region = framed(b);
        let err = receive_hello(&mut region, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, HandshakeError::Timeout);
    }
}
