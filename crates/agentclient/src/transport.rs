//! Delivery of requests to an agent
//!
//! A session never touches a socket directly. It hands each dispatched
//! [`Request`] to a [`Transport`] chosen when the session is created:
//!
//! - [`DirectTransport`]: the agent is connected to this management server;
//!   requests go onto the link task's outbound channel.
//! - [`ForwardingTransport`]: the agent is owned by a peer management server;
//!   requests are wrapped in a [`ForwardedRequest`] addressed to that peer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::types::{AgentId, DisconnectReason, Request};

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Hand `request` to the link; must not wait for the answer
    async fn send(&self, request: &Request) -> Result<(), TransportError>;

    /// The link can no longer deliver anything
    fn is_closed(&self) -> bool;

    /// Release the link after the session drained its state
    async fn disconnect(&self, _reason: DisconnectReason) {}
}

/// Outbound channel to a locally connected agent's link task
#[derive(Debug)]
pub struct DirectTransport {
    agent_id: AgentId,
    tx: mpsc::Sender<Request>,
    closed: AtomicBool,
}

impl DirectTransport {
    /// Create the transport and the receiver the link task drains
    pub fn new(agent_id: AgentId, capacity: usize) -> (Self, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(agent_id, tx), rx)
    }

    pub fn from_sender(agent_id: AgentId, tx: mpsc::Sender<Request>) -> Self {
        Self {
            agent_id,
            tx,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn send(&self, request: &Request) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.agent_id));
        }
        self.tx.try_send(request.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full(self.agent_id),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(self.agent_id),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    async fn disconnect(&self, reason: DisconnectReason) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Direct link to agent {} closed: {}", self.agent_id, reason);
        }
    }
}

/// A request routed through the management server that owns the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedRequest {
    pub peer: String,
    pub request: Request,
}

/// Routes requests to the peer management server that owns the agent
#[derive(Debug)]
pub struct ForwardingTransport {
    agent_id: AgentId,
    peer: String,
    tx: mpsc::Sender<ForwardedRequest>,
    peer_down: AtomicBool,
}

impl ForwardingTransport {
    pub fn new(agent_id: AgentId, peer: impl Into<String>, tx: mpsc::Sender<ForwardedRequest>) -> Self {
        Self {
            agent_id,
            peer: peer.into(),
            tx,
            peer_down: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Peer monitoring reported the owning server unreachable
    pub fn mark_peer_down(&self) {
        if !self.peer_down.swap(true, Ordering::AcqRel) {
            info!("Peer {} down; agent {} unreachable", self.peer, self.agent_id);
        }
    }

    fn unreachable(&self, reason: impl Into<String>) -> TransportError {
        TransportError::PeerUnreachable {
            peer: self.peer.clone(),
            agent_id: self.agent_id,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Transport for ForwardingTransport {
    async fn send(&self, request: &Request) -> Result<(), TransportError> {
        if self.peer_down.load(Ordering::Acquire) {
            return Err(self.unreachable("peer marked down"));
        }
        let envelope = ForwardedRequest {
            peer: self.peer.clone(),
            request: request.clone(),
        };
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => self.unreachable("forwarding queue full"),
            mpsc::error::TrySendError::Closed(_) => self.unreachable("forwarding channel closed"),
        })
    }

    fn is_closed(&self) -> bool {
        self.peer_down.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Command;

    fn req(seq: u64) -> Request {
        Request::new(3, seq, vec![Command::new("PingCommand")], false)
    }

    #[tokio::test]
    async fn test_direct_send_and_full() {
        let (transport, mut rx) = DirectTransport::new(3, 1);

        transport.send(&req(1)).await.unwrap();
        let err = transport.send(&req(2)).await.unwrap_err();
        assert!(matches!(err, TransportError::Full(3)));

        assert_eq!(rx.recv().await.map(|r| r.seq()), Some(1));
        transport.send(&req(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_closed_when_receiver_dropped() {
        let (transport, rx) = DirectTransport::new(3, 4);
        assert!(!transport.is_closed());
        drop(rx);
        assert!(transport.is_closed());
        assert!(matches!(
            transport.send(&req(1)).await,
            Err(TransportError::Closed(3))
        ));
    }

    #[tokio::test]
    async fn test_direct_disconnect_closes() {
        let (transport, _rx) = DirectTransport::new(3, 4);
        transport.disconnect(DisconnectReason::Down).await;
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_forwarding_wraps_and_peer_down() {
        let (tx, mut rx) = mpsc::channel(4);
        let transport = ForwardingTransport::new(3, "ms-2", tx);

        transport.send(&req(7)).await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.peer, "ms-2");
        assert_eq!(envelope.request.seq(), 7);

        transport.mark_peer_down();
        assert!(transport.is_closed());
        let err = transport.send(&req(8)).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerUnreachable { agent_id: 3, .. }));
    }
}
