//! Merkle commitment over the transactions of a block
//!
//! The tree is built recursively and preserves leaf order. A list of `n`
//! leaves is split so that the left subtree receives `ceil(n / 2)` leaves,
//! and an inner node is `sha256(uvarint(32) || left || uvarint(32) || right)`.
//! The base-chain contract recomputes roots from proofs, so the split rule and
//! the node encoding must not change.

use super::hash::{sha256, Hash};

/// uvarint encoding of 32, the length of each child digest
const CHILD_LENGTH_PREFIX: [u8; 1] = [32];

/// Root of a tree with no leaves
pub fn empty_root() -> Hash {
    sha256(b"")
}

/// Hash two child digests into their parent
fn combine(left: &Hash, right: &Hash) -> Hash {
    let mut data = Vec::with_capacity(2 * (CHILD_LENGTH_PREFIX.len() + 32));
    data.extend_from_slice(&CHILD_LENGTH_PREFIX);
    data.extend_from_slice(left);
    data.extend_from_slice(&CHILD_LENGTH_PREFIX);
    data.extend_from_slice(right);
    sha256(&data)
}

/// Number of leaves that go to the left subtree
fn split_point(len: usize) -> usize {
    (len + 1) / 2
}

/// Calculate the merkle root from a list of leaf hashes
pub fn calculate_merkle_root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => empty_root(),
        1 => leaves[0],
        n => {
            let mid = split_point(n);
            combine(
                &calculate_merkle_root(&leaves[..mid]),
                &calculate_merkle_root(&leaves[mid..]),
            )
        }
    }
}

/// Calculate the root together with the inclusion proof for `leaves[index]`
///
/// Returns `None` when `index` is out of range.
pub fn merkle_root_and_proof(leaves: &[Hash], index: usize) -> Option<(Hash, MerkleProof)> {
    if index >= leaves.len() {
        return None;
    }
    let mut siblings = Vec::new();
    let root = walk(leaves, index, &mut siblings);
    Some((
        root,
        MerkleProof {
            index,
            leaf_count: leaves.len(),
            siblings,
        },
    ))
}

fn walk(leaves: &[Hash], index: usize, siblings: &mut Vec<Hash>) -> Hash {
    if leaves.len() == 1 {
        return leaves[0];
    }

    let mid = split_point(leaves.len());
    if index < mid {
        let left = walk(&leaves[..mid], index, siblings);
        let right = calculate_merkle_root(&leaves[mid..]);
        siblings.push(right);
        combine(&left, &right)
    } else {
        let right = walk(&leaves[mid..], index - mid, siblings);
        let left = calculate_merkle_root(&leaves[..mid]);
        siblings.push(left);
        combine(&left, &right)
    }
}

/// Merkle proof for verifying transaction inclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Position of the proven leaf
    pub index: usize,
    /// Number of leaves in the tree
    pub leaf_count: usize,
    /// Sibling hashes from the leaf level up to the root
    pub siblings: Vec<Hash>,
}

impl MerkleProof {
    /// Verify the proof against a root hash
    ///
    /// Sides are derived by replaying the split rule over `leaf_count`, which
    /// is what makes proofs for unbalanced trees check out.
    pub fn verify(&self, leaf: &Hash, root: &Hash) -> bool {
        if self.index >= self.leaf_count {
            return false;
        }

        // true when the node on the path is a left child, root level first
        let mut path = Vec::new();
        let (mut index, mut len) = (self.index, self.leaf_count);
        while len > 1 {
            let mid = split_point(len);
            if index < mid {
                path.push(true);
                len = mid;
            } else {
                path.push(false);
                index -= mid;
                len -= mid;
            }
        }

        if path.len() != self.siblings.len() {
            return false;
        }

        let mut current = *leaf;
        for (sibling, is_left) in self.siblings.iter().zip(path.iter().rev()) {
            current = if *is_left {
                combine(&current, sibling)
            } else {
                combine(sibling, &current)
            };
        }

        current == *root
    }

    /// Siblings concatenated, the form submitted to the base chain
    pub fn to_bytes(&self) -> Vec<u8> {
        self.siblings.concat()
    }
}
