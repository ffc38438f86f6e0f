//! Kind-tagged, length-prefixed bincode wire protocol.
//!
//! Each logical stream carries exactly one frame:
//! `[1-byte kind tag][4-byte length (u32 big-endian)][bincode payload]`
//! Maximum payload size: 1MB (prevents memory exhaustion from a hostile peer)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RegistryError;
use crate::network::message::{MessageKind, PeerMessage};

/// Maximum allowed payload size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Serialize a message payload; the kind travels as the stream tag, not
/// inside the payload bytes.
pub fn encode_payload(message: &PeerMessage) -> Result<Vec<u8>, RegistryError> {
    let bytes = match message {
        PeerMessage::Connect(p) => bincode::serialize(p),
        PeerMessage::AckSig(p) | PeerMessage::RegSig(p) => bincode::serialize(p),
        PeerMessage::AckRec(p) | PeerMessage::RegRec(p) => bincode::serialize(p),
        PeerMessage::AckPay(p) | PeerMessage::RegPay(p) => bincode::serialize(p),
    }
    .map_err(|e| RegistryError::Serialization(format!("encode {}: {}", message.kind(), e)))?;

    if bytes.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(RegistryError::Serialization(format!(
            "payload too large: {} bytes (max: {})",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(bytes)
}

/// Decode a payload received on a stream tagged with `kind`.
///
/// Decode and validation failures are [`RegistryError::MalformedPayload`];
/// the caller drops the message without touching session state.
pub fn decode_payload(kind: MessageKind, bytes: &[u8]) -> Result<PeerMessage, RegistryError> {
    fn decode<T: serde::de::DeserializeOwned>(
        kind: MessageKind,
        bytes: &[u8],
    ) -> Result<T, RegistryError> {
        bincode::deserialize(bytes)
            .map_err(|e| RegistryError::MalformedPayload(format!("decode {}: {}", kind, e)))
    }

    let message = match kind {
        MessageKind::Connect => PeerMessage::Connect(decode(kind, bytes)?),
        MessageKind::AckSig => PeerMessage::AckSig(decode(kind, bytes)?),
        MessageKind::AckRec => PeerMessage::AckRec(decode(kind, bytes)?),
        MessageKind::AckPay => PeerMessage::AckPay(decode(kind, bytes)?),
        MessageKind::RegSig => PeerMessage::RegSig(decode(kind, bytes)?),
        MessageKind::RegRec => PeerMessage::RegRec(decode(kind, bytes)?),
        MessageKind::RegPay => PeerMessage::RegPay(decode(kind, bytes)?),
    };

    message
        .validate()
        .map_err(RegistryError::MalformedPayload)?;
    Ok(message)
}

/// Write one tagged frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: MessageKind,
    payload: &[u8],
) -> Result<(), RegistryError> {
    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(RegistryError::Serialization(format!(
            "frame too large: {} bytes (max: {})",
            len, MAX_FRAME_SIZE
        )));
    }

    writer
        .write_all(&[kind.tag()])
        .await
        .map_err(|e| RegistryError::Connection(format!("write frame tag: {}", e)))?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| RegistryError::Connection(format!("write frame length: {}", e)))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| RegistryError::Connection(format!("write frame payload: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| RegistryError::Connection(format!("flush frame: {}", e)))?;
    Ok(())
}

/// Read one tagged frame. Returns `Ok(None)` on clean EOF (connection closed).
///
/// An unknown tag is [`RegistryError::MalformedPayload`]: its frame bytes are
/// fully consumed first, so the caller may log, skip it, and keep reading.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(MessageKind, Vec<u8>)>, RegistryError> {
    let mut tag_buf = [0u8; 1];
    match reader.read_exact(&mut tag_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RegistryError::Connection(format!("read frame tag: {}", e))),
    }

    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RegistryError::Connection(format!("read frame length: {}", e)))?;
    let len = u32::from_be_bytes(len_buf);

    // Oversized frames are fatal: the payload is not consumed, so the stream
    // cannot stay aligned
    if len > MAX_FRAME_SIZE {
        return Err(RegistryError::Connection(format!(
            "frame too large: {} bytes (max: {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| RegistryError::Connection(format!("read frame payload: {}", e)))?;

    let kind = MessageKind::from_tag(tag_buf[0]).ok_or_else(|| {
        RegistryError::MalformedPayload(format!("unknown frame tag 0x{:02x}", tag_buf[0]))
    })?;

    Ok(Some((kind, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::ReceiptPayload;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let msg = PeerMessage::AckRec(ReceiptPayload {
            success: true,
            message: "stored".to_string(),
        });
        let payload = encode_payload(&msg).unwrap();

        let mut buf = Vec::new();
        write_frame(&mut buf, msg.kind(), &payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (kind, bytes) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(kind, MessageKind::AckRec);
        assert_eq!(decode_payload(kind, &bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = vec![MessageKind::Connect.tag()];
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, RegistryError::Connection(_)));
    }

    #[tokio::test]
    async fn test_unknown_tag_rejected() {
        let mut buf = vec![0x7f];
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPayload(_)));
    }

    #[test]
    fn test_decode_wrong_kind_is_malformed() {
        let msg = PeerMessage::AckRec(ReceiptPayload {
            success: true,
            message: "ok".to_string(),
        });
        let payload = encode_payload(&msg).unwrap();
        // A receipt body on a signature-tagged stream must not decode
        let err = decode_payload(MessageKind::AckSig, &payload).unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPayload(_)));
    }
}
