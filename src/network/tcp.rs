//! Framed TCP transport.
//!
//! One socket per partner. After connect, the dialer identifies itself with a
//! small hello (length-prefixed peer id); everything after that is the tagged
//! frame protocol from [`crate::network::wire`]. A background read loop turns
//! frames into complete inbound streams and dies quietly on EOF.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::network::message::MessageKind;
use crate::network::transport::{InboundStream, PeerConnection, PeerTransport};
use crate::network::wire;
use crate::types::PeerId;

const MAX_PEER_ID_LEN: u16 = 256;
const INBOUND_BUFFER: usize = 64;

pub struct TcpConnection {
    peer: PeerId,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    inbound: Mutex<mpsc::Receiver<InboundStream>>,
    open: Arc<AtomicBool>,
    read_loop: CancellationToken,
}

impl TcpConnection {
    fn spawn(peer: PeerId, stream: TcpStream) -> Arc<TcpConnection> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let open = Arc::new(AtomicBool::new(true));
        let token = CancellationToken::new();

        let conn = Arc::new(TcpConnection {
            peer: peer.clone(),
            writer: Mutex::new(BufWriter::new(write_half)),
            inbound: Mutex::new(rx),
            open: Arc::clone(&open),
            read_loop: token.clone(),
        });

        tokio::spawn(read_loop(peer, read_half, tx, open, token));
        conn
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }
}

async fn read_loop(
    peer: PeerId,
    read_half: OwnedReadHalf,
    tx: mpsc::Sender<InboundStream>,
    open: Arc<AtomicBool>,
    token: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = wire::read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some((kind, payload))) => {
                let stream = InboundStream {
                    kind,
                    payload: Bytes::from(payload),
                };
                if tx.send(stream).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("peer {} closed the connection", peer);
                break;
            }
            Err(RegistryError::MalformedPayload(reason)) => {
                // Skip the frame, keep the connection; peer input is
                // validated again at decode time anyway
                warn!("dropping malformed frame from {}: {}", peer, reason);
            }
            Err(e) => {
                warn!("read loop for {} ended: {}", peer, e);
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
}

#[async_trait]
impl PeerConnection for TcpConnection {
    async fn open_stream(&self, kind: MessageKind, payload: Bytes) -> Result<(), RegistryError> {
        if !self.is_open() {
            return Err(RegistryError::Connection("connection closed".to_string()));
        }
        let mut writer = self.writer.lock().await;
        wire::write_frame(&mut *writer, kind, &payload).await
    }

    async fn next_stream(&self) -> Option<InboundStream> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        self.read_loop.cancel();
        self.open.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// TCP transport bound to a listen address, with a static peer address book.
pub struct TcpTransport {
    local: PeerId,
    listener: Mutex<TcpListener>,
    peers: RwLock<HashMap<PeerId, String>>,
    dial_timeout: Duration,
}

impl TcpTransport {
    pub async fn bind(
        local: PeerId,
        listen_addr: &str,
        dial_timeout: Duration,
    ) -> Result<TcpTransport, RegistryError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| RegistryError::Connection(format!("bind {}: {}", listen_addr, e)))?;
        Ok(TcpTransport {
            local,
            listener: Mutex::new(listener),
            peers: RwLock::new(HashMap::new()),
            dial_timeout,
        })
    }

    pub async fn add_peer(&self, peer: PeerId, addr: String) {
        self.peers.write().await.insert(peer, addr);
    }

    pub async fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.lock().await.local_addr().ok()
    }

    async fn send_hello(&self, stream: &mut TcpStream) -> Result<(), RegistryError> {
        let id = self.local.as_str().as_bytes();
        let len = id.len() as u16;
        stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| RegistryError::Connection(format!("write hello: {}", e)))?;
        stream
            .write_all(id)
            .await
            .map_err(|e| RegistryError::Connection(format!("write hello: {}", e)))?;
        Ok(())
    }
}

async fn read_hello(stream: &mut TcpStream) -> Result<PeerId, RegistryError> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RegistryError::Connection(format!("read hello: {}", e)))?;
    let len = u16::from_be_bytes(len_buf);
    if len == 0 || len > MAX_PEER_ID_LEN {
        return Err(RegistryError::MalformedPayload(format!(
            "hello id length {} out of range",
            len
        )));
    }
    let mut id = vec![0u8; len as usize];
    stream
        .read_exact(&mut id)
        .await
        .map_err(|e| RegistryError::Connection(format!("read hello: {}", e)))?;
    let id = String::from_utf8(id)
        .map_err(|_| RegistryError::MalformedPayload("hello id not utf-8".to_string()))?;
    Ok(PeerId::new(id))
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn dial(
        &self,
        peer: &PeerId,
    ) -> Result<Arc<dyn PeerConnection>, RegistryError> {
        let addr = {
            let peers = self.peers.read().await;
            peers.get(peer).cloned()
        };
        let addr = addr.ok_or_else(|| RegistryError::PeerUnreachable { peer: peer.clone() })?;

        let connect = TcpStream::connect(&addr);
        let mut stream = match tokio::time::timeout(self.dial_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("dial {} at {} failed: {}", peer, addr, e);
                return Err(RegistryError::PeerUnreachable { peer: peer.clone() });
            }
            Err(_) => {
                warn!("dial {} at {} timed out", peer, addr);
                return Err(RegistryError::PeerUnreachable { peer: peer.clone() });
            }
        };

        stream
            .set_nodelay(true)
            .map_err(|e| RegistryError::Connection(format!("set_nodelay: {}", e)))?;
        self.send_hello(&mut stream).await?;

        debug!("connected to {} at {}", peer, addr);
        Ok(TcpConnection::spawn(peer.clone(), stream))
    }

    async fn accept(&self) -> Result<(PeerId, Arc<dyn PeerConnection>), RegistryError> {
        let (mut stream, remote_addr) = {
            let listener = self.listener.lock().await;
            listener
                .accept()
                .await
                .map_err(|e| RegistryError::Connection(format!("accept: {}", e)))?
        };

        stream
            .set_nodelay(true)
            .map_err(|e| RegistryError::Connection(format!("set_nodelay: {}", e)))?;
        let peer = read_hello(&mut stream).await?;
        debug!("accepted {} from {}", peer, remote_addr);

        let conn = TcpConnection::spawn(peer.clone(), stream);
        Ok((peer, conn as Arc<dyn PeerConnection>))
    }

    fn local_peer_id(&self) -> &PeerId {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{PeerMessage, ReceiptPayload};

    #[tokio::test]
    async fn test_tcp_dial_accept_round_trip() {
        let server = TcpTransport::bind(
            PeerId::from("server"),
            "127.0.0.1:0",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let addr = server.local_addr().await.unwrap();

        let client = TcpTransport::bind(
            PeerId::from("client"),
            "127.0.0.1:0",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        client
            .add_peer(PeerId::from("server"), addr.to_string())
            .await;

        let accept = tokio::spawn(async move { server.accept().await });

        let conn = client.dial(&PeerId::from("server")).await.unwrap();
        let (peer, server_conn) = accept.await.unwrap().unwrap();
        assert_eq!(peer, PeerId::from("client"));

        let msg = PeerMessage::AckRec(ReceiptPayload {
            success: true,
            message: "ok".to_string(),
        });
        let payload = wire::encode_payload(&msg).unwrap();
        conn.open_stream(msg.kind(), Bytes::from(payload))
            .await
            .unwrap();

        let stream = server_conn.next_stream().await.unwrap();
        assert_eq!(stream.kind, MessageKind::AckRec);
        let decoded = wire::decode_payload(stream.kind, &stream.payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_dial_unknown_peer() {
        let client = TcpTransport::bind(
            PeerId::from("client"),
            "127.0.0.1:0",
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let err = client.dial(&PeerId::from("ghost")).await.err().unwrap();
        assert!(matches!(err, RegistryError::PeerUnreachable { .. }));
    }
}
