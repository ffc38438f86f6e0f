use thiserror::Error;

use crate::types::PeerId;

/// Top-level error taxonomy for the coordination layer.
///
/// Low-level I/O errors are converted at the channel boundary; the
/// orchestrator never sees raw transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Peer unreachable: {peer}")]
    PeerUnreachable { peer: PeerId },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Contract rejected an expired deadline for {step}")]
    StaleDeadline { step: crate::types::RegistrationStep },

    #[error("Registration window expired at block {current_block} (expiry: {expiry_block})")]
    WindowExpired {
        current_block: u64,
        expiry_block: u64,
    },

    #[error("Canonical-chain confirmation timed out after {elapsed_ms}ms")]
    CrossChainTimeout { elapsed_ms: u64 },

    #[error("Submission rejected: {0}")]
    Submission(String),

    #[error("Delivery failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("No stored signature for {step}")]
    MissingSignature { step: crate::types::RegistrationStep },

    #[error("No partner paired for this session")]
    NoPartner,
}

/// Errors surfaced by the settlement collaborator. Converted into the
/// [`RegistryError`] taxonomy at the orchestrator boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// The contract rejected an expired deadline despite the pre-sign refetch
    #[error("Deadline already expired on contract")]
    StaleDeadline,

    /// Wallet or contract rejection; message is already sanitized for display
    #[error("Rejected: {0}")]
    Rejected(String),

    /// RPC/transport failure talking to the chain
    #[error("Chain transport error: {0}")]
    Transport(String),
}

impl RegistryError {
    /// Errors the user can retry without restarting the whole flow.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Connection(_)
                | RegistryError::PeerUnreachable { .. }
                | RegistryError::StaleDeadline { .. }
                | RegistryError::Submission(_)
                | RegistryError::RetriesExhausted { .. }
        )
    }

    /// Terminal failures that force a restart from acknowledgement.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistryError::WindowExpired { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_expired_is_terminal() {
        let err = RegistryError::WindowExpired {
            current_block: 120,
            expiry_block: 100,
        };
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cross_chain_timeout_is_soft() {
        let err = RegistryError::CrossChainTimeout { elapsed_ms: 120_000 };
        assert!(!err.is_terminal());
    }
}
