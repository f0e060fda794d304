//! Merkle commitment over the active transfer set.
//!
//! Leaves are the transfers' initial-state hashes, sorted lexicographically
//! so the root is independent of creation order. Pair hashing is keccak-256
//! over the sorted pair (commutative), which keeps proof verification free
//! of index bookkeeping; a level with an odd node count duplicates its last
//! node. The empty set commits to the all-zero root, matching the sentinel
//! a freshly set-up channel carries.

use crate::abi::keccak256;
use crate::state::Transfer;
use crate::types::Hash;

fn pair_hash(a: Hash, b: Hash) -> Hash {
    let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&lo.0);
    buf[32..].copy_from_slice(&hi.0);
    keccak256(&buf)
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] holds the sorted leaves; the last level holds the root.
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn new(mut leaves: Vec<Hash>) -> Self {
        leaves.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut levels = vec![leaves];
        while levels.last().unwrap().len() > 1 {
            let mut prev = levels.last().unwrap().clone();
            if prev.len() % 2 == 1 {
                prev.push(*prev.last().unwrap());
            }
            let next = prev.chunks(2).map(|p| pair_hash(p[0], p[1])).collect();
            levels.push(next);
        }
        MerkleTree { levels }
    }

    /// Commitment over the transfers' initial-state hashes.
    pub fn for_transfers(transfers: &[Transfer]) -> Self {
        Self::new(transfers.iter().map(|t| t.initial_state_hash).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    pub fn root(&self) -> Hash {
        match self.levels.last().unwrap().first() {
            Some(root) => *root,
            None => Hash::ZERO,
        }
    }

    /// Sibling path from the given leaf to the root, or `None` if the leaf
    /// is not part of the tree.
    pub fn proof(&self, leaf: Hash) -> Option<Vec<Hash>> {
        let mut index = self.levels[0].iter().position(|l| *l == leaf)?;
        let mut path = Vec::with_capacity(self.levels.len());
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if index % 2 == 0 { index + 1 } else { index - 1 };
            // The duplicated last node is its own sibling.
            let sibling = sibling.min(level.len() - 1);
            path.push(level[sibling]);
            index /= 2;
        }
        Some(path)
    }

    /// Check a sibling path against an expected root.
    pub fn verify(leaf: Hash, proof: &[Hash], root: Hash) -> bool {
        let mut current = leaf;
        for sibling in proof {
            current = pair_hash(current, *sibling);
        }
        current == root
    }
}

/// Root over the active transfer set, the value committed into every signed
/// channel state.
pub fn merkle_root(transfers: &[Transfer]) -> Hash {
    MerkleTree::for_transfers(transfers).root()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> Hash {
        Hash([byte; 32])
    }

    #[test]
    fn empty_set_commits_to_zero() {
        let tree = MerkleTree::new(Vec::new());
        assert!(tree.is_empty());
        assert_eq!(tree.root(), Hash::ZERO);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let tree = MerkleTree::new(vec![leaf(7)]);
        assert_eq!(tree.root(), leaf(7));
        assert_eq!(tree.proof(leaf(7)).unwrap(), Vec::<Hash>::new());
    }

    #[test]
    fn root_is_invariant_to_insertion_order() {
        let a = MerkleTree::new(vec![leaf(1), leaf(2), leaf(3)]);
        let b = MerkleTree::new(vec![leaf(3), leaf(1), leaf(2)]);
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn odd_levels_duplicate_the_last_leaf() {
        // Explicit duplication must equal the implicit one.
        let odd = MerkleTree::new(vec![leaf(1), leaf(2), leaf(3)]);
        let padded = MerkleTree::new(vec![leaf(1), leaf(2), leaf(3), leaf(3)]);
        assert_eq!(odd.root(), padded.root());
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        let leaves: Vec<Hash> = (1..=5).map(leaf).collect();
        let tree = MerkleTree::new(leaves.clone());
        for l in leaves {
            let proof = tree.proof(l).unwrap();
            assert!(MerkleTree::verify(l, &proof, tree.root()));
            assert!(!MerkleTree::verify(leaf(0xff), &proof, tree.root()));
        }
    }

    #[test]
    fn proof_for_unknown_leaf_is_none() {
        let tree = MerkleTree::new(vec![leaf(1), leaf(2)]);
        assert!(tree.proof(leaf(9)).is_none());
    }

    #[test]
    fn different_sets_different_roots() {
        let a = MerkleTree::new(vec![leaf(1), leaf(2)]);
        let b = MerkleTree::new(vec![leaf(1), leaf(2), leaf(3)]);
        assert_ne!(a.root(), b.root());
    }
}
