use chrono::Utc;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub type Hash256 = [u8; 32];

/// Numeric chain identifier as reported by wallets and contracts.
pub type ChainId = u64;

/// Expected length of a packed ECDSA signature (r ‖ s ‖ v).
pub const SIGNATURE_LEN: usize = 65;

/// Namespaced chain identifier used wherever a payload may span chains
/// (merkle leaves, claim ids). Format: `eip155:<id>`.
pub fn namespaced_chain_id(chain_id: ChainId) -> String {
    format!("eip155:{}", chain_id)
}

/// Which phase of the two-phase registration a signature authorizes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RegistrationStep {
    Acknowledgement,
    Registration,
}

impl RegistrationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStep::Acknowledgement => "acknowledgement",
            RegistrationStep::Registration => "registration",
        }
    }
}

impl std::fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier of a peer on the pairing transport.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// A signed authorization produced by the registeree's wallet for one step.
///
/// Unique per (address, chain_id, step); re-signing overwrites the previous
/// record. The signature bytes are wiped on drop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Compromised account the signature proves control of
    pub address: String,
    /// Chain the transaction will be submitted on
    pub chain_id: ChainId,
    pub step: RegistrationStep,
    /// Packed 65-byte signature (r ‖ s ‖ v)
    pub signature: Vec<u8>,
    pub nonce: u64,
    /// Contract deadline the signature is valid until
    pub deadline: u64,
    /// Chain the compromise happened on (may differ from chain_id)
    pub reported_chain_id: ChainId,
    /// When the compromise occurred, unix seconds
    pub incident_timestamp: i64,
    /// When this record was stored, unix seconds
    pub stored_at: i64,
}

impl SignatureRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: String,
        chain_id: ChainId,
        step: RegistrationStep,
        signature: Vec<u8>,
        nonce: u64,
        deadline: u64,
        reported_chain_id: ChainId,
        incident_timestamp: i64,
    ) -> Self {
        Self {
            address,
            chain_id,
            step,
            signature,
            nonce,
            deadline,
            reported_chain_id,
            incident_timestamp,
            stored_at: Utc::now().timestamp(),
        }
    }
}

impl Drop for SignatureRecord {
    fn drop(&mut self) {
        self.signature.zeroize();
    }
}

/// On-chain progress of the current claim. Mutated by confirmation events,
/// persists until explicit reset.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub acknowledgement_hash: Option<Hash256>,
    pub acknowledgement_chain_id: Option<ChainId>,
    pub registration_hash: Option<Hash256>,
    pub registration_chain_id: Option<ChainId>,
    /// Cross-chain message id when the registration settles via a bridge
    pub bridge_message_id: Option<Hash256>,
    /// Content hash the canonical-chain claim is tracked under
    pub content_hash: Option<Hash256>,
}

impl RegistrationRecord {
    pub fn clear(&mut self) {
        *self = RegistrationRecord::default();
    }

    /// Drop acknowledgement progress only (restart after window expiry).
    pub fn clear_acknowledgement(&mut self) {
        self.acknowledgement_hash = None;
        self.acknowledgement_chain_id = None;
    }
}

/// One transaction inside a batched claim. Immutable merkle input.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TransactionBatchLeaf {
    pub tx_hash: Hash256,
    pub chain_id: ChainId,
}

/// Address metadata exchanged during pairing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimForm {
    /// The compromised account being registered
    pub compromised_address: String,
    /// Where any recovered assets should be directed
    pub recipient_address: String,
    pub reported_chain_id: ChainId,
    /// When the compromise occurred, unix seconds
    pub incident_timestamp: i64,
}

pub fn short_hash(hash: &Hash256) -> String {
    format!("{}…", hex::encode(&hash[..4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_chain_id() {
        assert_eq!(namespaced_chain_id(1), "eip155:1");
        assert_eq!(namespaced_chain_id(42161), "eip155:42161");
    }

    #[test]
    fn test_step_display() {
        assert_eq!(
            RegistrationStep::Acknowledgement.to_string(),
            "acknowledgement"
        );
        assert_eq!(RegistrationStep::Registration.to_string(), "registration");
    }

    #[test]
    fn test_registration_record_partial_clear() {
        let mut record = RegistrationRecord {
            acknowledgement_hash: Some([1u8; 32]),
            acknowledgement_chain_id: Some(1),
            registration_hash: Some([2u8; 32]),
            ..Default::default()
        };

        record.clear_acknowledgement();
        assert!(record.acknowledgement_hash.is_none());
        assert!(record.acknowledgement_chain_id.is_none());
        // Registration progress is untouched
        assert!(record.registration_hash.is_some());
    }
}
