//! Peer channel: message-level send/receive over a transport connection.
//!
//! Owns the connection cache (one live connection per partner) and the
//! pairing session state. All transport errors are converted to the
//! [`RegistryError`] taxonomy here; nothing above this layer sees raw I/O.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::network::message::PeerMessage;
use crate::network::session::{PeerSession, SessionState};
use crate::network::transport::{InboundStream, PeerConnection, PeerTransport};
use crate::network::wire;
use crate::types::PeerId;

pub struct PeerChannel {
    transport: Arc<dyn PeerTransport>,
    connections: RwLock<HashMap<PeerId, Arc<dyn PeerConnection>>>,
    session: RwLock<PeerSession>,
}

impl PeerChannel {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Arc<PeerChannel> {
        let local = transport.local_peer_id().clone();
        Arc::new(PeerChannel {
            transport,
            connections: RwLock::new(HashMap::new()),
            session: RwLock::new(PeerSession::new(local)),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id().clone()
    }

    pub async fn session(&self) -> PeerSession {
        self.session.read().await.clone()
    }

    pub async fn with_session<R>(&self, f: impl FnOnce(&mut PeerSession) -> R) -> R {
        let mut session = self.session.write().await;
        f(&mut session)
    }

    /// Return the live connection for `peer`, dialing if necessary.
    pub async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn PeerConnection>, RegistryError> {
        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(peer) {
                if conn.is_open() {
                    return Ok(Arc::clone(conn));
                }
            }
        }

        self.with_session(|s| s.try_transition(SessionState::Connecting))
            .await;

        let conn = match self.transport.dial(peer).await {
            Ok(conn) => conn,
            Err(e) => {
                self.with_session(|s| s.try_transition(SessionState::Disconnected))
                    .await;
                return Err(e);
            }
        };

        self.connections
            .write()
            .await
            .insert(peer.clone(), Arc::clone(&conn));
        self.with_session(|s| {
            s.set_partner(peer.clone());
            s.try_transition(SessionState::Connected)
        })
        .await;

        debug!("channel ready for {}", peer);
        Ok(conn)
    }

    /// Adopt a connection the transport accepted from `peer`.
    pub async fn adopt(&self, peer: PeerId, conn: Arc<dyn PeerConnection>) {
        self.connections
            .write()
            .await
            .insert(peer.clone(), Arc::clone(&conn));
        self.with_session(|s| {
            s.set_partner(peer);
            s.try_transition(SessionState::Connected)
        })
        .await;
    }

    /// Serialize and send one message: open a kind-tagged stream, write,
    /// close the write side.
    pub async fn send_on(
        &self,
        conn: &Arc<dyn PeerConnection>,
        message: &PeerMessage,
    ) -> Result<(), RegistryError> {
        let payload = wire::encode_payload(message)?;
        conn.open_stream(message.kind(), Bytes::from(payload)).await
    }

    /// Dial-and-send convenience used by everything above this layer.
    pub async fn send_to(
        &self,
        peer: &PeerId,
        message: &PeerMessage,
    ) -> Result<(), RegistryError> {
        let conn = self.dial(peer).await?;
        self.send_on(&conn, message).await
    }

    /// Send to the paired partner.
    pub async fn send_to_partner(&self, message: &PeerMessage) -> Result<(), RegistryError> {
        let partner = self
            .session
            .read()
            .await
            .partner_peer_id
            .clone()
            .ok_or(RegistryError::NoPartner)?;
        self.send_to(&partner, message).await
    }

    /// Decode and validate a complete inbound stream.
    ///
    /// Schema violations are [`RegistryError::MalformedPayload`]; the caller
    /// logs and drops without touching session state.
    pub fn receive(&self, stream: &InboundStream) -> Result<PeerMessage, RegistryError> {
        wire::decode_payload(stream.kind, &stream.payload)
    }

    /// Close and forget every connection, reset the pairing.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = {
            let mut map = self.connections.write().await;
            map.drain().collect()
        };
        for (peer, conn) in connections {
            debug!("closing connection to {}", peer);
            conn.close().await;
        }
        self.with_session(|s| s.reset()).await;
    }
}

/// Drain inbound streams from `conn`, decoding and handing each message to
/// `handle`. Messages are processed strictly in order, each to completion,
/// so handlers for the same kind never interleave within a session.
pub async fn drain_connection<F, Fut>(channel: &PeerChannel, conn: Arc<dyn PeerConnection>, mut handle: F)
where
    F: FnMut(PeerMessage) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    while let Some(stream) = conn.next_stream().await {
        match channel.receive(&stream) {
            Ok(message) => handle(message).await,
            Err(RegistryError::MalformedPayload(reason)) => {
                warn!("dropping malformed {} payload: {}", stream.kind, reason);
            }
            Err(e) => {
                warn!("receive error on {} stream: {}", stream.kind, e);
            }
        }
    }
    debug!("inbound stream source ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryHub;
    use crate::network::message::ReceiptPayload;

    fn receipt(success: bool) -> PeerMessage {
        PeerMessage::AckRec(ReceiptPayload {
            success,
            message: "stored".to_string(),
        })
    }

    #[tokio::test]
    async fn test_send_and_receive_round_trip() {
        let hub = MemoryHub::new();
        let alice_tp = Arc::new(hub.endpoint(PeerId::from("alice")).await);
        let bob_tp = Arc::new(hub.endpoint(PeerId::from("bob")).await);

        let alice = PeerChannel::new(alice_tp);
        let bob = PeerChannel::new(bob_tp.clone() as Arc<dyn PeerTransport>);

        let accept = tokio::spawn(async move { bob_tp.accept().await });

        alice
            .send_to(&PeerId::from("bob"), &receipt(true))
            .await
            .unwrap();

        let (peer, conn) = accept.await.unwrap().unwrap();
        bob.adopt(peer, Arc::clone(&conn)).await;

        let stream = conn.next_stream().await.unwrap();
        let msg = bob.receive(&stream).unwrap();
        assert_eq!(msg, receipt(true));
        assert!(bob.session().await.state().is_connected());
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let hub = MemoryHub::new();
        let alice_tp = Arc::new(hub.endpoint(PeerId::from("alice")).await);
        let _bob_tp = Arc::new(hub.endpoint(PeerId::from("bob")).await);

        let alice = PeerChannel::new(alice_tp);
        let first = alice.dial(&PeerId::from("bob")).await.unwrap();
        let second = alice.dial(&PeerId::from("bob")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_dial_failure_resets_session() {
        let hub = MemoryHub::new();
        let alice_tp = Arc::new(hub.endpoint(PeerId::from("alice")).await);
        let alice = PeerChannel::new(alice_tp);

        let err = alice.dial(&PeerId::from("ghost")).await.err().unwrap();
        assert!(matches!(err, RegistryError::PeerUnreachable { .. }));
        assert_eq!(alice.session().await.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_to_partner_requires_pairing() {
        let hub = MemoryHub::new();
        let alice_tp = Arc::new(hub.endpoint(PeerId::from("alice")).await);
        let alice = PeerChannel::new(alice_tp);

        let err = alice.send_to_partner(&receipt(true)).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoPartner));
    }
}
