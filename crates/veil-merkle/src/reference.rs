//! Dense in-memory tree used to cross-check the incremental accumulator
//! and to audit proofs before they feed a witness.
//!
//! Empty subtrees short-circuit to the precomputed zero hashes, so a
//! depth-32 tree over a handful of leaves stays cheap.

use ark_bn254::Fr;

use crate::{hash_pair, zero_hash, MerkleProof, TREE_DEPTH};

/// A complete tree rebuilt from an in-order leaf slice.
pub struct ReferenceTree {
    depth: usize,
    leaves: Vec<Fr>,
}

impl ReferenceTree {
    pub fn new(depth: Option<usize>) -> Self {
        Self {
            depth: depth.unwrap_or(TREE_DEPTH).max(1),
            leaves: Vec::new(),
        }
    }

    pub fn from_leaves(depth: Option<usize>, leaves: &[Fr]) -> Self {
        let mut tree = Self::new(depth);
        tree.leaves.extend_from_slice(leaves);
        tree
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn push(&mut self, leaf: Fr) {
        self.leaves.push(leaf);
    }

    pub fn root(&self) -> Fr {
        self.node(self.depth, 0)
    }

    /// Build the proof for one leaf index.
    pub fn proof(&self, leaf_index: u64) -> MerkleProof {
        let mut path = Vec::with_capacity(self.depth + 1);
        let mut pos = leaf_index as usize;

        path.push(self.node(0, pos));
        for level in 0..self.depth {
            path.push(self.node(level, pos ^ 1));
            pos /= 2;
        }

        MerkleProof { leaf_index, path }
    }

    fn node(&self, level: usize, position: usize) -> Fr {
        if level == 0 {
            return self
                .leaves
                .get(position)
                .copied()
                .unwrap_or_else(|| zero_hash(0));
        }

        // Entirely-empty subtree shortcut.
        if position << level >= self.leaves.len() {
            return zero_hash(level);
        }

        let left = self.node(level - 1, position * 2);
        let right = self.node(level - 1, position * 2 + 1);
        hash_pair(left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify_proof;

    #[test]
    fn empty_tree_root_is_zero_hash() {
        let tree = ReferenceTree::new(Some(8));
        assert_eq!(tree.root(), zero_hash(8));
    }

    #[test]
    fn single_leaf_deep_tree_is_tractable() {
        let mut tree = ReferenceTree::new(None);
        tree.push(Fr::from(42u64));
        assert_ne!(tree.root(), zero_hash(TREE_DEPTH));
        assert!(verify_proof(&tree.proof(0), tree.root(), TREE_DEPTH));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        let leaves: Vec<Fr> = (1..=8u64).map(Fr::from).collect();
        let tree = ReferenceTree::from_leaves(Some(8), &leaves);
        let root = tree.root();
        for i in 0..8 {
            assert!(verify_proof(&tree.proof(i), root, 8), "leaf {}", i);
        }
    }

    #[test]
    fn tampered_proof_fails() {
        let leaves: Vec<Fr> = (1..=4u64).map(Fr::from).collect();
        let tree = ReferenceTree::from_leaves(Some(8), &leaves);
        let mut proof = tree.proof(2);
        proof.path[3] += Fr::from(1u64);
        assert!(!verify_proof(&proof, tree.root(), 8));
    }
}
