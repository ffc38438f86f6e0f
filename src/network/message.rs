//! Protocol messages exchanged between registeree and relayer.
//!
//! The message set is closed: every stream a peer opens is tagged with one of
//! these kinds, and anything else is dropped at the codec. Payloads are plain
//! serde structs; semantic validation happens in [`PeerMessage::validate`]
//! because peer input is never trusted without it.

use serde::{Deserialize, Serialize};

use crate::types::{ChainId, ClaimForm, Hash256, PeerId, SIGNATURE_LEN};

/// Stream tag for one logical message.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connect,
    AckSig,
    AckRec,
    AckPay,
    RegSig,
    RegRec,
    RegPay,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Connect,
        MessageKind::AckSig,
        MessageKind::AckRec,
        MessageKind::AckPay,
        MessageKind::RegSig,
        MessageKind::RegRec,
        MessageKind::RegPay,
    ];

    /// Single-byte wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            MessageKind::Connect => 0x01,
            MessageKind::AckSig => 0x02,
            MessageKind::AckRec => 0x03,
            MessageKind::AckPay => 0x04,
            MessageKind::RegSig => 0x05,
            MessageKind::RegRec => 0x06,
            MessageKind::RegPay => 0x07,
        }
    }

    pub fn from_tag(tag: u8) -> Option<MessageKind> {
        match tag {
            0x01 => Some(MessageKind::Connect),
            0x02 => Some(MessageKind::AckSig),
            0x03 => Some(MessageKind::AckRec),
            0x04 => Some(MessageKind::AckPay),
            0x05 => Some(MessageKind::RegSig),
            0x06 => Some(MessageKind::RegRec),
            0x07 => Some(MessageKind::RegPay),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Connect => "Connect",
            MessageKind::AckSig => "AckSig",
            MessageKind::AckRec => "AckRec",
            MessageKind::AckPay => "AckPay",
            MessageKind::RegSig => "RegSig",
            MessageKind::RegRec => "RegRec",
            MessageKind::RegPay => "RegPay",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pairing handshake: address form plus transport identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectPayload {
    pub form: ClaimForm,
    pub p2p: PartnerInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartnerInfo {
    pub partner_peer_id: PeerId,
}

/// Transactions covered by a batched claim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchFields {
    pub tx_hashes: Vec<Hash256>,
    pub tx_chain_ids: Vec<ChainId>,
}

/// A signed authorization handed to the relayer for submission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignaturePayload {
    /// Packed 65-byte signature (r ‖ s ‖ v)
    pub value: Vec<u8>,
    pub deadline: u64,
    pub nonce: u64,
    /// Compromised account the signature covers
    pub address: String,
    /// Chain the relayer must submit on
    pub chain_id: ChainId,
    /// Opaque reference to the signing key (wallet/account label)
    pub key_ref: String,
    pub reported_chain_id: ChainId,
    pub incident_timestamp: i64,
    #[serde(default)]
    pub batch: Option<BatchFields>,
}

/// Receipt for a previously sent signature.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptPayload {
    pub success: bool,
    pub message: String,
}

/// Relayed result of an on-chain submission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxRelayPayload {
    pub hash: Hash256,
    pub tx_chain_id: ChainId,
    /// Bridge message id when the submission chain is non-canonical
    #[serde(default)]
    pub message_id: Option<Hash256>,
}

/// One logical peer message. Closed set; dispatch is exhaustive per role.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerMessage {
    Connect(ConnectPayload),
    AckSig(SignaturePayload),
    AckRec(ReceiptPayload),
    AckPay(TxRelayPayload),
    RegSig(SignaturePayload),
    RegRec(ReceiptPayload),
    RegPay(TxRelayPayload),
}

impl PeerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerMessage::Connect(_) => MessageKind::Connect,
            PeerMessage::AckSig(_) => MessageKind::AckSig,
            PeerMessage::AckRec(_) => MessageKind::AckRec,
            PeerMessage::AckPay(_) => MessageKind::AckPay,
            PeerMessage::RegSig(_) => MessageKind::RegSig,
            PeerMessage::RegRec(_) => MessageKind::RegRec,
            PeerMessage::RegPay(_) => MessageKind::RegPay,
        }
    }

    /// Semantic validation applied to every received message before dispatch.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PeerMessage::Connect(payload) => {
                if payload.form.compromised_address.is_empty() {
                    return Err("empty compromised address".to_string());
                }
                if payload.form.recipient_address.is_empty() {
                    return Err("empty recipient address".to_string());
                }
                if payload.form.reported_chain_id == 0 {
                    return Err("zero reported chain id".to_string());
                }
                if payload.p2p.partner_peer_id.as_str().is_empty() {
                    return Err("empty partner peer id".to_string());
                }
                Ok(())
            }
            PeerMessage::AckSig(payload) | PeerMessage::RegSig(payload) => {
                if payload.value.len() != SIGNATURE_LEN {
                    return Err(format!(
                        "signature must be {} bytes, got {}",
                        SIGNATURE_LEN,
                        payload.value.len()
                    ));
                }
                if payload.address.is_empty() {
                    return Err("empty signer address".to_string());
                }
                if payload.chain_id == 0 {
                    return Err("zero chain id".to_string());
                }
                if let Some(batch) = &payload.batch {
                    if batch.tx_hashes.len() != batch.tx_chain_ids.len() {
                        return Err(format!(
                            "batch has {} hashes but {} chain ids",
                            batch.tx_hashes.len(),
                            batch.tx_chain_ids.len()
                        ));
                    }
                    if batch.tx_hashes.is_empty() {
                        return Err("empty batch".to_string());
                    }
                }
                Ok(())
            }
            PeerMessage::AckRec(payload) | PeerMessage::RegRec(payload) => {
                // Failure receipts must say why
                if !payload.success && payload.message.is_empty() {
                    return Err("failure receipt without message".to_string());
                }
                Ok(())
            }
            PeerMessage::AckPay(payload) | PeerMessage::RegPay(payload) => {
                if payload.tx_chain_id == 0 {
                    return Err("zero transaction chain id".to_string());
                }
                if payload.hash == [0u8; 32] {
                    return Err("zero transaction hash".to_string());
                }
                Ok(())
            }
        }
    }
}
