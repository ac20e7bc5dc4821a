//! Double-SHA256 merkle tree over transaction IDs.
//!
//! Leaves are the txids themselves; an internal node is
//! `SHA256d(left || right)`, and an odd layer duplicates its last element.
//! That duplication is the source of the duplicate-tail malleability the
//! validation pipeline's seen-txid set defends against: appending a copy of
//! the trailing transactions reproduces the same root.
//!
//! [`MerkleBuilder`] computes the root in streaming fashion so the first
//! pipeline stage never buffers a whole block.

use sha2::{Digest, Sha256};

use crate::types::Hash256;

/// Internal node hash: `SHA256d(left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    let first = hasher.finalize();
    Hash256(Sha256::digest(first).into())
}

/// Compute the merkle root of a txid list.
///
/// A single txid is its own root; an empty list yields [`Hash256::ZERO`].
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    let mut builder = MerkleBuilder::new();
    for txid in txids {
        builder.push(*txid);
    }
    builder.finish()
}

/// Streaming merkle root computation.
///
/// Holds one pending node per tree level; `push` is amortized O(1) and the
/// builder uses O(log n) memory regardless of block size.
#[derive(Clone, Debug, Default)]
pub struct MerkleBuilder {
    /// `levels[i]` holds a completed subtree of 2^i leaves awaiting its
    /// right sibling.
    levels: Vec<Option<Hash256>>,
    count: u64,
}

impl MerkleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves pushed so far.
    pub fn leaf_count(&self) -> u64 {
        self.count
    }

    /// Append a leaf (a txid).
    pub fn push(&mut self, txid: Hash256) {
        self.count += 1;
        let mut node = txid;
        let mut level = 0;
        loop {
            if level == self.levels.len() {
                self.levels.push(None);
            }
            match self.levels[level].take() {
                None => {
                    self.levels[level] = Some(node);
                    return;
                }
                Some(left) => {
                    node = node_hash(&left, &node);
                    level += 1;
                }
            }
        }
    }

    /// Finalize the tree, duplicating lone nodes on odd layers.
    pub fn finish(mut self) -> Hash256 {
        let Some(top) = self.levels.iter().rposition(|l| l.is_some()) else {
            return Hash256::ZERO;
        };

        let mut carry: Option<Hash256> = None;
        for level in 0..=top {
            let slot = self.levels[level].take();
            carry = match (slot, carry) {
                (None, None) => None,
                // A lone node below the top pairs with itself.
                (None, Some(c)) => Some(node_hash(&c, &c)),
                (Some(l), Some(c)) => Some(node_hash(&l, &c)),
                (Some(l), None) => {
                    if level == top {
                        Some(l)
                    } else {
                        Some(node_hash(&l, &l))
                    }
                }
            };
        }
        carry.expect("top level was occupied")
    }
}
