//! Transport abstraction consumed by the overlay engine (§6.2)
//!
//! A transport provider supplies pairwise reliable-ordered connections with
//! `open`/`data`/`close`/`error` events and connection metadata delivered on
//! the receiver before the first `data`. This crate only consumes the trait;
//! a production transport adapter (QUIC, WebRTC, or similar) is the
//! embedding application's concern. [`MockTransport`] is the in-process
//! reference implementation every test in this workspace is built on.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::ids::{GameId, PeerId, Secret};

/// Metadata carried on connection establishment, validated by the receiver
/// before any `data` event is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub game_id: GameId,
    pub secret: Secret,
    pub role: ConnectionRole,
}

/// The role a connection was opened under. Cousin connections are registered
/// symmetrically but never added as children (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Standard,
    Cousin,
}

/// Events observed on a connection, keyed by the remote peer they arrived on
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open(ConnectionMetadata),
    Data(Vec<u8>),
    Closed,
    Error(String),
}

/// Transport trait consumed by the overlay engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// This transport's own peer id
    fn local_id(&self) -> &PeerId;

    /// Ensure a connection to `peer` exists, sending `metadata` on open
    async fn connect(&self, peer: PeerId, metadata: ConnectionMetadata) -> Result<(), TransportError>;

    /// Send a payload to a connected peer
    async fn send(&self, peer: &PeerId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close a connection. Idempotent.
    async fn close(&self, peer: &PeerId) -> Result<(), TransportError>;

    fn is_connected(&self, peer: &PeerId) -> bool;

    fn connected_peers(&self) -> Vec<PeerId>;

    /// Await the next transport event for any connection (incoming or
    /// previously established via [`Transport::connect`]).
    async fn next_event(&self) -> Result<(PeerId, TransportEvent), TransportError>;
}

type Inbox = mpsc::UnboundedReceiver<(PeerId, TransportEvent)>;
type InboxSender = mpsc::UnboundedSender<(PeerId, TransportEvent)>;

/// Shared hub wiring a set of [`MockTransport`] instances together in one
/// process, standing in for the external unicast transport in tests.
#[derive(Default)]
pub struct MockNetwork {
    senders: DashMap<PeerId, InboxSender>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new peer on the network and get its transport handle
    pub fn register(self: &Arc<Self>, local_id: PeerId) -> MockTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(local_id.clone(), tx);
        MockTransport {
            local_id,
            network: Arc::clone(self),
            inbox: Mutex::new(rx),
            connected: DashMap::new(),
        }
    }

    fn sender_for(&self, peer: &PeerId) -> Option<InboxSender> {
        self.senders.get(peer).map(|e| e.clone())
    }
}

/// In-memory [`Transport`] implementation backed by a [`MockNetwork`]
pub struct MockTransport {
    local_id: PeerId,
    network: Arc<MockNetwork>,
    inbox: Mutex<Inbox>,
    connected: DashMap<PeerId, ()>,
}

#[async_trait]
impl Transport for MockTransport {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn connect(&self, peer: PeerId, metadata: ConnectionMetadata) -> Result<(), TransportError> {
        let sender = self
            .network
            .sender_for(&peer)
            .ok_or_else(|| TransportError::ConnectionFailed(peer.to_string()))?;
        sender
            .send((self.local_id.clone(), TransportEvent::Open(metadata)))
            .map_err(|_| TransportError::ConnectionFailed(peer.to_string()))?;
        self.connected.insert(peer, ());
        Ok(())
    }

    async fn send(&self, peer: &PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.contains_key(peer) {
            return Err(TransportError::PeerNotConnected(peer.to_string()));
        }
        let sender = self
            .network
            .sender_for(peer)
            .ok_or_else(|| TransportError::PeerNotConnected(peer.to_string()))?;
        sender
            .send((self.local_id.clone(), TransportEvent::Data(payload)))
            .map_err(|_| TransportError::SendFailed(peer.to_string()))
    }

    async fn close(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.connected.remove(peer);
        if let Some(sender) = self.network.sender_for(peer) {
            let _ = sender.send((self.local_id.clone(), TransportEvent::Closed));
        }
        Ok(())
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.contains_key(peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.iter().map(|e| e.key().clone()).collect()
    }

    async fn next_event(&self) -> Result<(PeerId, TransportEvent), TransportError> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((from, event)) => {
                match &event {
                    TransportEvent::Open(_) => {
                        self.connected.insert(from.clone(), ());
                    }
                    TransportEvent::Closed => {
                        self.connected.remove(&from);
                    }
                    _ => {}
                }
                Ok((from, event))
            }
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn meta() -> ConnectionMetadata {
        ConnectionMetadata {
            game_id: GameId::new("g").unwrap(),
            secret: Secret::new("s").unwrap(),
            role: ConnectionRole::Standard,
        }
    }

    #[tokio::test]
    async fn connect_delivers_open_with_metadata_to_peer() {
        let net = MockNetwork::new();
        let a = net.register(pid("a"));
        let b = net.register(pid("b"));

        a.connect(pid("b"), meta()).await.unwrap();

        let (from, event) = b.next_event().await.unwrap();
        assert_eq!(from, pid("a"));
        assert!(matches!(event, TransportEvent::Open(_)));
        assert!(a.is_connected(&pid("b")));
    }

    #[tokio::test]
    async fn send_requires_prior_connect() {
        let net = MockNetwork::new();
        let a = net.register(pid("a"));
        let _b = net.register(pid("b"));

        let err = a.send(&pid("b"), vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerNotConnected(_)));
    }

    #[tokio::test]
    async fn close_is_observed_symmetrically() {
        let net = MockNetwork::new();
        let a = net.register(pid("a"));
        let b = net.register(pid("b"));

        a.connect(pid("b"), meta()).await.unwrap();
        let _ = b.next_event().await.unwrap();

        a.close(&pid("b")).await.unwrap();
        let (from, event) = b.next_event().await.unwrap();
        assert_eq!(from, pid("a"));
        assert!(matches!(event, TransportEvent::Closed));
    }
}
