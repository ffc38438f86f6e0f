//! Transport abstraction for the peer channel.
//!
//! Peer discovery and transport negotiation live outside this crate; whatever
//! performs them hands us something that can open kind-tagged one-shot streams
//! to a partner. Two implementations ship here: a framed TCP socket
//! ([`crate::network::tcp`]) and an in-memory duplex pair
//! ([`crate::network::memory`]) used by tests and same-process sessions.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RegistryError;
use crate::network::message::MessageKind;
use crate::types::PeerId;

/// An inbound stream: one complete, kind-tagged payload.
///
/// Transports deliver streams only after the sender closed its write side,
/// so the payload is always whole.
#[derive(Clone, Debug)]
pub struct InboundStream {
    pub kind: MessageKind,
    pub payload: Bytes,
}

/// A live connection to one partner.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open a stream tagged `kind`, write the payload, close the write side.
    async fn open_stream(&self, kind: MessageKind, payload: Bytes) -> Result<(), RegistryError>;

    /// Next complete inbound stream; `None` when the peer is gone.
    async fn next_stream(&self) -> Option<InboundStream>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Capability to reach peers by identifier.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Establish (or fail to establish) a connection to `peer`.
    async fn dial(
        &self,
        peer: &PeerId,
    ) -> Result<std::sync::Arc<dyn PeerConnection>, RegistryError>;

    /// Wait for an inbound connection. Returns the dialing peer's id.
    async fn accept(
        &self,
    ) -> Result<(PeerId, std::sync::Arc<dyn PeerConnection>), RegistryError>;

    /// Identifier this endpoint announces.
    fn local_peer_id(&self) -> &PeerId;
}
