//! Incremental Merkle accumulator mirroring the on-chain commitment tree.
//!
//! Leaves are promoted to the main tree in fixed 32-leaf subtree batches,
//! exactly as the contract does. The right edge of the tree lives in a
//! compact frontier (one node per level), so a batch flush costs O(depth)
//! hashes and O(depth) persisted nodes.

use std::sync::OnceLock;

use ark_bn254::Fr;
use veil_crypto::poseidon::{self, HashDomain};

pub mod accumulator;
pub mod reference;
pub mod remote;

pub use accumulator::{LeafInsert, MerkleAccumulator, ProofMode};
pub use remote::{HttpProofService, ProofService, RemoteProofBundle};

/// Tree depth, matching the on-chain contract.
pub const TREE_DEPTH: usize = 32;

/// log2 of the subtree batch size.
pub const SUBTREE_BITS: usize = 5;

/// Leaves per subtree batch.
pub const SUBTREE_SIZE: u64 = 1 << SUBTREE_BITS;

/// Pair hash in the Merkle domain.
pub fn hash_pair(left: Fr, right: Fr) -> Fr {
    poseidon::hash_pair(left, right, HashDomain::Merkle)
}

/// Zero hash at `level`: Z[0] = 0, Z[l] = H(Z[l-1], Z[l-1]).
pub fn zero_hash(level: usize) -> Fr {
    static ZEROS: OnceLock<Vec<Fr>> = OnceLock::new();
    let zeros = ZEROS.get_or_init(|| {
        let mut hashes = Vec::with_capacity(TREE_DEPTH + 1);
        hashes.push(Fr::from(0u64));
        for _ in 0..TREE_DEPTH {
            let prev = *hashes.last().unwrap();
            hashes.push(hash_pair(prev, prev));
        }
        hashes
    });
    zeros.get(level).copied().unwrap_or_else(|| Fr::from(0u64))
}

/// Inclusion proof for a single leaf.
///
/// `path` is `[leaf, sibling_0, sibling_1, ..., sibling_{depth-1}]`, so its
/// length is depth + 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub path: Vec<Fr>,
}

impl MerkleProof {
    /// A stub for a leaf not yet promoted to the main tree: all-zero path
    /// of the expected length. Callers treat it as unverifiable.
    pub fn stub(leaf_index: u64, depth: usize) -> Self {
        Self {
            leaf_index,
            path: vec![Fr::from(0u64); depth + 1],
        }
    }

    pub fn is_stub(&self) -> bool {
        self.path.iter().all(|f| *f == Fr::from(0u64))
    }
}

/// Proofs for a batch of cids plus the root they verify against.
#[derive(Debug, Clone)]
pub struct ProofBundle {
    pub proofs: Vec<MerkleProof>,
    pub root: Fr,
}

/// Recompute the root implied by a proof and compare.
pub fn verify_proof(proof: &MerkleProof, root: Fr, depth: usize) -> bool {
    if proof.path.len() != depth + 1 {
        return false;
    }

    let mut current = proof.path[0];
    let mut pos = proof.leaf_index;

    for sibling in &proof.path[1..] {
        if pos % 2 == 0 {
            current = hash_pair(current, *sibling);
        } else {
            current = hash_pair(*sibling, current);
        }
        pos /= 2;
    }

    current == root
}
