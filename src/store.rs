//! Session-scoped signature store.
//!
//! One record per (address, chain_id, step); re-signing overwrites. Nothing
//! here touches disk: records are cleared on success or user reset, and the
//! signature bytes zeroize themselves on drop.

use dashmap::DashMap;

use crate::types::{ChainId, RegistrationStep, SignatureRecord};

type Key = (String, ChainId, RegistrationStep);

#[derive(Default)]
pub struct SignatureStore {
    records: DashMap<Key, SignatureRecord>,
}

impl SignatureStore {
    pub fn new() -> SignatureStore {
        SignatureStore::default()
    }

    /// Store a record, replacing any previous signature for the same key.
    pub fn put(&self, record: SignatureRecord) {
        let key = (record.address.clone(), record.chain_id, record.step);
        self.records.insert(key, record);
    }

    pub fn get(
        &self,
        address: &str,
        chain_id: ChainId,
        step: RegistrationStep,
    ) -> Option<SignatureRecord> {
        self.records
            .get(&(address.to_string(), chain_id, step))
            .map(|entry| entry.value().clone())
    }

    /// Find the record for (address, step) on whichever chain it was signed
    /// for. A session holds at most one record per step.
    pub fn find(&self, address: &str, step: RegistrationStep) -> Option<SignatureRecord> {
        self.records
            .iter()
            .find(|entry| {
                let (addr, _, s) = entry.key();
                addr.as_str() == address && *s == step
            })
            .map(|entry| entry.value().clone())
    }

    /// Remove the record for one step (done with it after submission).
    pub fn remove(&self, address: &str, chain_id: ChainId, step: RegistrationStep) {
        self.records.remove(&(address.to_string(), chain_id, step));
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
