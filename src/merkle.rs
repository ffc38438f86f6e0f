//! Merkle batch builder for multi-transaction claims.
//!
//! A batch commits to a set of `(tx_hash, chain_id)` leaves under a single
//! root that both parties sign over. Construction is deterministic: leaf
//! hashes are sorted before the tree is built, so identical leaf multisets in
//! any order produce the same root. Pair hashes sort their operands byte-wise,
//! so a proof verifies regardless of sibling order. An odd node at any level
//! is promoted unchanged to the next level, never duplicated.

use sha2::{Digest, Sha256};

use crate::error::RegistryError;
use crate::types::{namespaced_chain_id, ChainId, Hash256, TransactionBatchLeaf};

/// Hash of one leaf: H(tx_hash ‖ namespaced_chain_id).
///
/// The chain id is namespaced before hashing because a batch may span chains
/// and two chains can carry the same transaction hash.
pub fn leaf_hash(tx_hash: &Hash256, chain_id: ChainId) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(tx_hash);
    hasher.update(namespaced_chain_id(chain_id).as_bytes());
    hasher.finalize().into()
}

/// Hash of an interior node: H(sorted(left, right)).
fn node_hash(a: &Hash256, b: &Hash256) -> Hash256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo);
    hasher.update(hi);
    hasher.finalize().into()
}

/// Validate raw batch input before any network or contract call.
///
/// Fails fast locally on count mismatch, empty input, or duplicate leaves.
pub fn validate_batch(
    tx_hashes: &[Hash256],
    chain_ids: &[ChainId],
) -> Result<Vec<TransactionBatchLeaf>, RegistryError> {
    if tx_hashes.len() != chain_ids.len() {
        return Err(RegistryError::InvalidBatch(format!(
            "{} transaction hashes but {} chain ids",
            tx_hashes.len(),
            chain_ids.len()
        )));
    }
    if tx_hashes.is_empty() {
        return Err(RegistryError::InvalidBatch("empty batch".to_string()));
    }

    let leaves: Vec<TransactionBatchLeaf> = tx_hashes
        .iter()
        .zip(chain_ids.iter())
        .map(|(tx_hash, chain_id)| TransactionBatchLeaf {
            tx_hash: *tx_hash,
            chain_id: *chain_id,
        })
        .collect();

    let mut seen = std::collections::HashSet::new();
    for leaf in &leaves {
        if !seen.insert(*leaf) {
            return Err(RegistryError::InvalidBatch(format!(
                "duplicate leaf {}",
                hex::encode(leaf.tx_hash)
            )));
        }
    }

    Ok(leaves)
}

/// Immutable merkle tree over a transaction batch. Built once per batch.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    root: Hash256,
    /// Leaves in the order the caller supplied them
    leaves: Vec<TransactionBatchLeaf>,
    /// leaf_hashes[i] corresponds to leaves[i]
    leaf_hashes: Vec<Hash256>,
    /// levels[0] holds the sorted leaf hashes; the last level is the root
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a tree over the given leaves.
    ///
    /// Returns `None` for a zero-leaf batch: a proof of nothing is unsound.
    pub fn build(leaves: &[TransactionBatchLeaf]) -> Option<MerkleTree> {
        if leaves.is_empty() {
            return None;
        }

        let leaf_hashes: Vec<Hash256> = leaves
            .iter()
            .map(|leaf| leaf_hash(&leaf.tx_hash, leaf.chain_id))
            .collect();

        let mut sorted = leaf_hashes.clone();
        sorted.sort();

        let mut levels = vec![sorted];
        while levels.last().map(|level| level.len()).unwrap_or(0) > 1 {
            let current = levels.last().expect("levels is non-empty");
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for chunk in current.chunks(2) {
                if chunk.len() == 2 {
                    next.push(node_hash(&chunk[0], &chunk[1]));
                } else {
                    // Odd node: promote unchanged. Duplicating it would let a
                    // single leaf masquerade as a repeated one.
                    next.push(chunk[0]);
                }
            }
            levels.push(next);
        }

        let root = levels.last().and_then(|level| level.first()).copied()?;

        Some(MerkleTree {
            root,
            leaves: leaves.to_vec(),
            leaf_hashes,
            levels,
        })
    }

    pub fn root(&self) -> Hash256 {
        self.root
    }

    pub fn leaves(&self) -> &[TransactionBatchLeaf] {
        &self.leaves
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Sibling path for the leaf at the caller's original `index`.
    pub fn proof_of(&self, index: usize) -> Option<Vec<Hash256>> {
        let target = *self.leaf_hashes.get(index)?;
        let mut pos = self.levels[0].binary_search(&target).ok()?;

        let mut proof = Vec::new();
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
            if sibling < level.len() {
                proof.push(level[sibling]);
            }
            // A promoted odd node contributes nothing at this level
            pos /= 2;
        }
        Some(proof)
    }

    /// Proof lookup by transaction. Recomputes the leaf hash and locates it
    /// by scan; batches are small enough that a scan is fine.
    pub fn proof_by_tx(&self, tx_hash: &Hash256, chain_id: ChainId) -> Option<Vec<Hash256>> {
        let target = leaf_hash(tx_hash, chain_id);
        let index = self.leaf_hashes.iter().position(|h| *h == target)?;
        self.proof_of(index)
    }

    /// Reconstruct the root from a leaf hash and its sibling path.
    pub fn verify_proof(root: &Hash256, leaf: &Hash256, proof: &[Hash256]) -> bool {
        let mut acc = *leaf;
        for sibling in proof {
            acc = node_hash(&acc, sibling);
        }
        acc == *root
    }
}
