//! In-memory duplex transport.
//!
//! Substitutes for a real socket when both parties run in one process, and in
//! tests where the wire must be deterministic and lossy-on-demand. Frames are
//! complete `(kind, payload)` pairs pushed through bounded channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::RegistryError;
use crate::network::message::MessageKind;
use crate::network::transport::{InboundStream, PeerConnection, PeerTransport};
use crate::types::PeerId;

const CHANNEL_CAPACITY: usize = 64;

type FrameSender = mpsc::Sender<InboundStream>;
type FrameReceiver = mpsc::Receiver<InboundStream>;

/// One side of an in-memory connection.
pub struct MemoryConnection {
    peer: PeerId,
    tx: FrameSender,
    rx: Mutex<FrameReceiver>,
    open: AtomicBool,
    /// Test hook: fail the next N sends with a connection error
    fail_next_sends: Arc<std::sync::atomic::AtomicU32>,
    /// Test hook: fail the next N sends of one specific kind only
    fail_kind: parking_lot::Mutex<Option<(MessageKind, u32)>>,
}

impl MemoryConnection {
    /// Build both ends of a duplex connection.
    pub fn pair(a: PeerId, b: PeerId) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_to_a_tx, b_to_a_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let side_a = Arc::new(MemoryConnection {
            peer: b,
            tx: a_to_b_tx,
            rx: Mutex::new(b_to_a_rx),
            open: AtomicBool::new(true),
            fail_next_sends: Arc::new(std::sync::atomic::AtomicU32::new(0)),
            fail_kind: parking_lot::Mutex::new(None),
        });
        let side_b = Arc::new(MemoryConnection {
            peer: a,
            tx: b_to_a_tx,
            rx: Mutex::new(a_to_b_rx),
            open: AtomicBool::new(true),
            fail_next_sends: Arc::new(std::sync::atomic::AtomicU32::new(0)),
            fail_kind: parking_lot::Mutex::new(None),
        });
        (side_a, side_b)
    }

    /// Make the next `count` sends fail as if the stream could not open.
    pub fn fail_next_sends(&self, count: u32) {
        self.fail_next_sends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` sends of `kind` fail; other kinds pass through.
    pub fn fail_next_sends_of(&self, kind: MessageKind, count: u32) {
        *self.fail_kind.lock() = Some((kind, count));
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn open_stream(&self, kind: MessageKind, payload: Bytes) -> Result<(), RegistryError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RegistryError::Connection("connection closed".to_string()));
        }

        let remaining = self.fail_next_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(RegistryError::Connection(
                "simulated stream open failure".to_string(),
            ));
        }

        {
            let mut fail_kind = self.fail_kind.lock();
            if let Some((failing, count)) = fail_kind.as_mut() {
                if *failing == kind && *count > 0 {
                    *count -= 1;
                    return Err(RegistryError::Connection(format!(
                        "simulated {} stream failure",
                        kind
                    )));
                }
            }
        }

        self.tx
            .send(InboundStream { kind, payload })
            .await
            .map_err(|_| RegistryError::Connection("peer hung up".to_string()))
    }

    async fn next_stream(&self) -> Option<InboundStream> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

type EndpointMap = Arc<Mutex<HashMap<PeerId, mpsc::Sender<(PeerId, Arc<MemoryConnection>)>>>>;

/// Registry of in-process endpoints, dialable by peer id.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: EndpointMap,
}

impl MemoryHub {
    pub fn new() -> MemoryHub {
        MemoryHub::default()
    }

    /// Register an endpoint and get a transport bound to `peer_id`.
    pub async fn endpoint(&self, peer_id: PeerId) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(8);
        self.endpoints.lock().await.insert(peer_id.clone(), tx);
        MemoryTransport {
            endpoints: Arc::clone(&self.endpoints),
            local: peer_id,
            pending: Mutex::new(rx),
        }
    }
}

/// Transport over a [`MemoryHub`].
pub struct MemoryTransport {
    endpoints: EndpointMap,
    local: PeerId,
    pending: Mutex<mpsc::Receiver<(PeerId, Arc<MemoryConnection>)>>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn dial(
        &self,
        peer: &PeerId,
    ) -> Result<Arc<dyn PeerConnection>, RegistryError> {
        let accept_tx = {
            let endpoints = self.endpoints.lock().await;
            endpoints.get(peer).cloned()
        };
        let accept_tx = accept_tx.ok_or_else(|| RegistryError::PeerUnreachable {
            peer: peer.clone(),
        })?;

        let (ours, theirs) = MemoryConnection::pair(self.local.clone(), peer.clone());
        accept_tx
            .send((self.local.clone(), theirs))
            .await
            .map_err(|_| RegistryError::PeerUnreachable { peer: peer.clone() })?;

        debug!("memory transport: {} dialed {}", self.local, peer);
        Ok(ours)
    }

    async fn accept(&self) -> Result<(PeerId, Arc<dyn PeerConnection>), RegistryError> {
        let mut pending = self.pending.lock().await;
        match pending.recv().await {
            Some((peer, conn)) => Ok((peer, conn as Arc<dyn PeerConnection>)),
            None => Err(RegistryError::Connection(
                "memory hub dropped".to_string(),
            )),
        }
    }

    fn local_peer_id(&self) -> &PeerId {
        &self.local
    }
}
