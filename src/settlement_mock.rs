//! In-process settlement client.
//!
//! Deterministic stand-in for the real contract bindings: an advancing block
//! counter, per-address nonces, scriptable failures, and a settable
//! canonical-chain registry. Integration tests and local two-party rehearsals
//! run against this.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::SettlementError;
use crate::settlement::{
    AcknowledgementParams, DeadlineWindow, HashStruct, RegistrationParams, SettlementClient,
    SignatureParts, SubmissionReceipt,
};
use crate::types::Hash256;

#[derive(Default)]
struct MockState {
    current_block: u64,
    nonces: HashMap<String, u64>,
    /// Grace window assigned when an acknowledgement lands
    windows: HashMap<String, (u64, u64)>,
    registered: HashSet<Hash256>,
    /// Scripted submit failures, consumed in order
    submit_failures: Vec<SettlementError>,
    submissions: u64,
}

/// Blocks after acknowledgement before the grace window opens.
const GRACE_DELAY_BLOCKS: u64 = 10;
/// Width of the registration window once open.
const WINDOW_BLOCKS: u64 = 100;

pub struct MockSettlement {
    state: Mutex<MockState>,
}

impl MockSettlement {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                current_block: 1,
                ..Default::default()
            }),
        }
    }

    pub fn advance_blocks(&self, n: u64) {
        self.state.lock().current_block += n;
    }

    pub fn current_block(&self) -> u64 {
        self.state.lock().current_block
    }

    /// Queue a failure for the next submission.
    pub fn fail_next_submit(&self, error: SettlementError) {
        self.state.lock().submit_failures.push(error);
    }

    /// Mark a claim as settled on the canonical chain.
    pub fn settle_claim(&self, claim_id: Hash256) {
        self.state.lock().registered.insert(claim_id);
    }

    pub fn submission_count(&self) -> u64 {
        self.state.lock().submissions
    }

    fn tx_hash(&self, label: &str, n: u64) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update(n.to_be_bytes());
        hasher.finalize().into()
    }
}

impl Default for MockSettlement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementClient for MockSettlement {
    async fn nonce(&self, address: &str) -> Result<u64, SettlementError> {
        Ok(*self.state.lock().nonces.get(address).unwrap_or(&0))
    }

    async fn deadlines(&self, address: &str) -> Result<DeadlineWindow, SettlementError> {
        let state = self.state.lock();
        let current_block = state.current_block;
        let (start_block, expiry_block) = state
            .windows
            .get(address)
            .copied()
            .unwrap_or((u64::MAX, u64::MAX));
        let is_expired = expiry_block != u64::MAX && current_block >= expiry_block;
        Ok(DeadlineWindow {
            current_block,
            start_block,
            expiry_block,
            grace_starts_at: 0,
            time_left: expiry_block.saturating_sub(current_block) as i64,
            is_expired,
        })
    }

    async fn acknowledgement_hash_struct(
        &self,
        params: &AcknowledgementParams,
    ) -> Result<HashStruct, SettlementError> {
        let deadline = self.state.lock().current_block + 20;
        let mut hasher = Sha256::new();
        hasher.update(b"ack");
        hasher.update(params.compromised_address.as_bytes());
        hasher.update(params.nonce.to_be_bytes());
        hasher.update(deadline.to_be_bytes());
        Ok(HashStruct {
            deadline,
            digest: hasher.finalize().into(),
        })
    }

    async fn registration_hash_struct(
        &self,
        params: &RegistrationParams,
    ) -> Result<HashStruct, SettlementError> {
        let deadline = self.state.lock().current_block + 20;
        let mut hasher = Sha256::new();
        hasher.update(b"reg");
        hasher.update(params.compromised_address.as_bytes());
        hasher.update(params.nonce.to_be_bytes());
        hasher.update(deadline.to_be_bytes());
        if let Some(root) = params.batch_root {
            hasher.update(root);
        }
        Ok(HashStruct {
            deadline,
            digest: hasher.finalize().into(),
        })
    }

    async fn submit_acknowledgement(
        &self,
        params: &AcknowledgementParams,
        _sig: &SignatureParts,
    ) -> Result<SubmissionReceipt, SettlementError> {
        let mut state = self.state.lock();
        if !state.submit_failures.is_empty() {
            return Err(state.submit_failures.remove(0));
        }
        if params.deadline <= state.current_block {
            return Err(SettlementError::StaleDeadline);
        }

        state.submissions += 1;
        let n = state.submissions;
        *state
            .nonces
            .entry(params.compromised_address.clone())
            .or_insert(0) += 1;

        let start = state.current_block + GRACE_DELAY_BLOCKS;
        state.windows.insert(
            params.compromised_address.clone(),
            (start, start + WINDOW_BLOCKS),
        );
        // Submission itself consumes a block
        state.current_block += 1;
        drop(state);

        Ok(SubmissionReceipt {
            tx_hash: self.tx_hash("ack", n),
            message_id: None,
        })
    }

    async fn submit_registration(
        &self,
        params: &RegistrationParams,
        _sig: &SignatureParts,
    ) -> Result<SubmissionReceipt, SettlementError> {
        let mut state = self.state.lock();
        if !state.submit_failures.is_empty() {
            return Err(state.submit_failures.remove(0));
        }
        if params.deadline <= state.current_block {
            return Err(SettlementError::StaleDeadline);
        }

        let window = state.windows.get(&params.compromised_address).copied();
        match window {
            Some((start, expiry)) => {
                if state.current_block < start {
                    return Err(SettlementError::Rejected(
                        "grace period not open".to_string(),
                    ));
                }
                if state.current_block >= expiry {
                    return Err(SettlementError::Rejected(
                        "registration window expired".to_string(),
                    ));
                }
            }
            None => {
                return Err(SettlementError::Rejected(
                    "no acknowledgement on record".to_string(),
                ))
            }
        }

        state.submissions += 1;
        let n = state.submissions;
        *state
            .nonces
            .entry(params.compromised_address.clone())
            .or_insert(0) += 1;
        state.current_block += 1;
        drop(state);

        let message_id = Some(self.tx_hash("bridge", n));
        Ok(SubmissionReceipt {
            tx_hash: self.tx_hash("reg", n),
            message_id,
        })
    }

    async fn is_registered(&self, claim_id: &Hash256) -> Result<bool, SettlementError> {
        Ok(self.state.lock().registered.contains(claim_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_params() -> AcknowledgementParams {
        AcknowledgementParams {
            compromised_address: "0xvictim".to_string(),
            recipient_address: "0xsafe".to_string(),
            chain_id: 137,
            nonce: 0,
            deadline: 100,
        }
    }

    fn sig() -> SignatureParts {
        SignatureParts {
            v: 27,
            r: [1u8; 32],
            s: [2u8; 32],
        }
    }

    #[tokio::test]
    async fn test_ack_opens_window_and_bumps_nonce() {
        let mock = MockSettlement::new();
        assert_eq!(mock.nonce("0xvictim").await.unwrap(), 0);

        mock.submit_acknowledgement(&ack_params(), &sig())
            .await
            .unwrap();

        assert_eq!(mock.nonce("0xvictim").await.unwrap(), 1);
        let window = mock.deadlines("0xvictim").await.unwrap();
        assert!(window.start_block > window.current_block);
        assert!(!window.is_open());

        mock.advance_blocks(GRACE_DELAY_BLOCKS);
        let window = mock.deadlines("0xvictim").await.unwrap();
        assert!(window.is_open());
    }

    #[tokio::test]
    async fn test_registration_requires_open_window() {
        let mock = MockSettlement::new();
        let reg = RegistrationParams {
            compromised_address: "0xvictim".to_string(),
            recipient_address: "0xsafe".to_string(),
            chain_id: 137,
            nonce: 1,
            deadline: 100,
            reported_chain_id: 1,
            incident_timestamp: 0,
            batch_root: None,
            tx_hashes: vec![],
            tx_chain_ids: vec![],
        };

        // No acknowledgement yet
        assert!(mock.submit_registration(&reg, &sig()).await.is_err());

        mock.submit_acknowledgement(&ack_params(), &sig())
            .await
            .unwrap();
        // Window not open yet
        assert!(mock.submit_registration(&reg, &sig()).await.is_err());

        mock.advance_blocks(GRACE_DELAY_BLOCKS);
        let receipt = mock.submit_registration(&reg, &sig()).await.unwrap();
        assert!(receipt.message_id.is_some());
    }

    #[tokio::test]
    async fn test_scripted_failure_consumed() {
        let mock = MockSettlement::new();
        mock.fail_next_submit(SettlementError::Rejected("wallet declined".to_string()));

        assert!(mock
            .submit_acknowledgement(&ack_params(), &sig())
            .await
            .is_err());
        assert!(mock
            .submit_acknowledgement(&ack_params(), &sig())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_claim_settlement() {
        let mock = MockSettlement::new();
        let id = [7u8; 32];
        assert!(!mock.is_registered(&id).await.unwrap());
        mock.settle_claim(id);
        assert!(mock.is_registered(&id).await.unwrap());
    }
}
