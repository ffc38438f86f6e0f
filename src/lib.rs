//! reclaim: two-party compromised-account registration coordinator.
//!
//! A registeree proves control of a compromised account by signing
//! authorization digests; a relayer pays the gas to submit them, because the
//! registeree's own funds may be unusable. Registration is a two-phase commit
//! against a settlement contract (acknowledgement, mandatory grace period,
//! then registration), coordinated over an ephemeral point-to-point channel.
//! Submissions on a non-canonical chain are confirmed asynchronously against
//! the canonical chain.
//!
//! This crate is the coordination layer only: wallet signing, contract ABI
//! encoding, and peer transport negotiation are collaborators behind traits.

pub mod config;
pub mod confirmation;
pub mod error;
pub mod logging;
pub mod merkle;
pub mod network;
pub mod orchestrator;
pub mod settlement;
pub mod settlement_mock;
pub mod signer;
pub mod store;
pub mod types;

pub use config::{Config, Role};
pub use confirmation::{claim_id, ConfirmationPoller, ConfirmationStatus};
pub use error::{RegistryError, SettlementError};
pub use merkle::MerkleTree;
pub use network::channel::PeerChannel;
pub use network::message::{MessageKind, PeerMessage};
pub use orchestrator::{
    claim_content_hash, RegistrationOrchestrator, RegistrationOutcome, RegistrationStage,
    SubmissionPath,
};
pub use settlement::SettlementClient;
pub use signer::DigestSigner;
pub use types::{ClaimForm, Hash256, PeerId, RegistrationStep};
