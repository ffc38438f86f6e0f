//! Wallet signing collaborator surface.
//!
//! The actual cryptography lives in the embedder's wallet; this layer only
//! hands over a digest and stores the returned 65-byte signature opaquely.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::RegistryError;
use crate::types::{Hash256, SIGNATURE_LEN};

#[async_trait]
pub trait DigestSigner: Send + Sync {
    /// Sign a 32-byte digest, returning the packed signature (r ‖ s ‖ v).
    async fn sign_digest(&self, digest: &Hash256) -> Result<Vec<u8>, RegistryError>;

    /// Opaque reference to the signing key, relayed alongside signatures.
    fn key_ref(&self) -> String;
}

/// Deterministic signer for tests and rehearsals: expands the digest with a
/// fixed label so distinct digests give distinct "signatures". Not a real
/// signature.
pub struct MockSigner {
    label: String,
}

impl MockSigner {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl DigestSigner for MockSigner {
    async fn sign_digest(&self, digest: &Hash256) -> Result<Vec<u8>, RegistryError> {
        let mut out = Vec::with_capacity(SIGNATURE_LEN);

        let mut hasher = Sha256::new();
        hasher.update(self.label.as_bytes());
        hasher.update(b"r");
        hasher.update(digest);
        out.extend_from_slice(&hasher.finalize());

        let mut hasher = Sha256::new();
        hasher.update(self.label.as_bytes());
        hasher.update(b"s");
        hasher.update(digest);
        out.extend_from_slice(&hasher.finalize());

        out.push(27);
        Ok(out)
    }

    fn key_ref(&self) -> String {
        self.label.clone()
    }
}
