//! Settlement contract collaborator surface.
//!
//! ABI encoding, gas, and wallet plumbing live outside this crate; the
//! orchestrator consumes this trait and nothing else. Parameters are passed
//! through opaquely. Implementations convert their transport errors into
//! [`SettlementError`] before returning.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SettlementError;
use crate::types::{ChainId, Hash256, SIGNATURE_LEN};

/// Grace-window boundaries for one address, as the contract reports them.
///
/// Always read from the contract, never computed locally: block-time drift
/// between devices would desynchronize the two parties.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DeadlineWindow {
    pub current_block: u64,
    pub start_block: u64,
    pub expiry_block: u64,
    /// Unix seconds at which the grace period opens (display only)
    pub grace_starts_at: i64,
    /// Seconds until expiry (display only)
    pub time_left: i64,
    pub is_expired: bool,
}

impl DeadlineWindow {
    pub fn is_open(&self) -> bool {
        self.current_block >= self.start_block && !self.has_closed()
    }

    pub fn has_closed(&self) -> bool {
        self.is_expired || self.current_block >= self.expiry_block
    }
}

/// Digest the wallet must sign, with the deadline it embeds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HashStruct {
    pub deadline: u64,
    pub digest: Hash256,
}

/// Split form of a packed 65-byte signature, as the contract wants it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignatureParts {
    pub v: u8,
    pub r: Hash256,
    pub s: Hash256,
}

impl SignatureParts {
    /// Split `r ‖ s ‖ v`. Length is validated at the wire boundary too, but
    /// stored signatures pass through here before every submission.
    pub fn from_packed(bytes: &[u8]) -> Result<SignatureParts, SettlementError> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(SettlementError::Rejected(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LEN,
                bytes.len()
            )));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(SignatureParts { v: bytes[64], r, s })
    }
}

/// Everything an acknowledgement transaction needs besides the signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcknowledgementParams {
    pub compromised_address: String,
    pub recipient_address: String,
    pub chain_id: ChainId,
    pub nonce: u64,
    pub deadline: u64,
}

/// Everything a registration transaction needs besides the signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationParams {
    pub compromised_address: String,
    pub recipient_address: String,
    pub chain_id: ChainId,
    pub nonce: u64,
    pub deadline: u64,
    pub reported_chain_id: ChainId,
    pub incident_timestamp: i64,
    /// Merkle commitment when registering a batch of transactions
    pub batch_root: Option<Hash256>,
    pub tx_hashes: Vec<Hash256>,
    pub tx_chain_ids: Vec<ChainId>,
}

/// Submission result: the transaction hash, plus the bridge message id when
/// the submission chain settles onto the canonical chain asynchronously.
#[derive(Clone, Copy, Debug)]
pub struct SubmissionReceipt {
    pub tx_hash: Hash256,
    pub message_id: Option<Hash256>,
}

/// The settlement contract as this layer sees it.
///
/// `submit_*` returns once the transaction is accepted on the submission
/// chain, so a returned hash is safe to relay to the partner.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    async fn nonce(&self, address: &str) -> Result<u64, SettlementError>;

    async fn deadlines(&self, address: &str) -> Result<DeadlineWindow, SettlementError>;

    async fn acknowledgement_hash_struct(
        &self,
        params: &AcknowledgementParams,
    ) -> Result<HashStruct, SettlementError>;

    async fn registration_hash_struct(
        &self,
        params: &RegistrationParams,
    ) -> Result<HashStruct, SettlementError>;

    async fn submit_acknowledgement(
        &self,
        params: &AcknowledgementParams,
        sig: &SignatureParts,
    ) -> Result<SubmissionReceipt, SettlementError>;

    async fn submit_registration(
        &self,
        params: &RegistrationParams,
        sig: &SignatureParts,
    ) -> Result<SubmissionReceipt, SettlementError>;

    /// Canonical-chain predicate: has this claim id settled?
    async fn is_registered(&self, claim_id: &Hash256) -> Result<bool, SettlementError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_parts_split() {
        let mut packed = Vec::new();
        packed.extend_from_slice(&[0x11; 32]);
        packed.extend_from_slice(&[0x22; 32]);
        packed.push(27);

        let parts = SignatureParts::from_packed(&packed).unwrap();
        assert_eq!(parts.r, [0x11; 32]);
        assert_eq!(parts.s, [0x22; 32]);
        assert_eq!(parts.v, 27);
    }

    #[test]
    fn test_signature_parts_wrong_length() {
        assert!(SignatureParts::from_packed(&[0u8; 64]).is_err());
        assert!(SignatureParts::from_packed(&[0u8; 66]).is_err());
    }

    #[test]
    fn test_window_predicates() {
        let window = DeadlineWindow {
            current_block: 50,
            start_block: 100,
            expiry_block: 200,
            ..Default::default()
        };
        assert!(!window.is_open());
        assert!(!window.has_closed());

        let open = DeadlineWindow {
            current_block: 150,
            ..window
        };
        assert!(open.is_open());

        let closed = DeadlineWindow {
            current_block: 200,
            ..window
        };
        assert!(closed.has_closed());
        assert!(!closed.is_open());
    }
}
