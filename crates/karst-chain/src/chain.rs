//! A materialized chain: genesis through one tip.
//!
//! Chains are produced on demand from the header index and replaced
//! atomically behind a lock by their owners; the struct itself is
//! immutable. Fork-point queries against another chain cost O(Δ height).

use std::sync::Arc;

use karst_core::types::{ChainedHeader, Hash256};

/// Ordered headers from genesis to a tip; element `i` sits at height `i`.
#[derive(Clone, Debug)]
pub struct Chain {
    headers: Vec<Arc<ChainedHeader>>,
}

/// The three pieces of a reorganization from one chain to another.
#[derive(Clone, Debug)]
pub struct ReorgPlan {
    pub common_ancestor: Arc<ChainedHeader>,
    /// Blocks to unwind, deepest (current tip) first.
    pub rewind: Vec<Arc<ChainedHeader>>,
    /// Blocks to apply, lowest first.
    pub advance: Vec<Arc<ChainedHeader>>,
}

impl Chain {
    /// Build from a genesis-anchored header list.
    ///
    /// Callers (the index) guarantee linkage; debug builds verify it.
    pub fn new(headers: Vec<Arc<ChainedHeader>>) -> Self {
        debug_assert!(!headers.is_empty());
        debug_assert_eq!(headers[0].height, 0);
        debug_assert!(headers.windows(2).all(|w| {
            w[1].header.prev_hash == w[0].hash && w[1].height == w[0].height + 1
        }));
        Self { headers }
    }

    pub fn genesis(&self) -> &Arc<ChainedHeader> {
        &self.headers[0]
    }

    pub fn tip(&self) -> &Arc<ChainedHeader> {
        self.headers.last().expect("chain is never empty")
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn at_height(&self, height: u32) -> Option<&Arc<ChainedHeader>> {
        self.headers.get(height as usize)
    }

    /// Whether the chain passes through this exact header.
    pub fn contains(&self, header: &ChainedHeader) -> bool {
        self.at_height(header.height)
            .is_some_and(|h| h.hash == header.hash)
    }

    pub fn contains_hash(&self, hash: &Hash256, height: u32) -> bool {
        self.at_height(height).is_some_and(|h| h.hash == *hash)
    }

    pub fn headers(&self) -> &[Arc<ChainedHeader>] {
        &self.headers
    }

    /// Deepest header shared with `other`. Always exists for two chains
    /// anchored on the same genesis.
    pub fn fork_point(&self, other: &Chain) -> Option<Arc<ChainedHeader>> {
        let mut height = self.height().min(other.height());
        loop {
            let ours = self.at_height(height)?;
            let theirs = other.at_height(height)?;
            if ours.hash == theirs.hash {
                return Some(Arc::clone(ours));
            }
            if height == 0 {
                return None;
            }
            height -= 1;
        }
    }

    /// Plan the reorganization that moves the active tip from `self` to
    /// `target`.
    pub fn reorg_plan(&self, target: &Chain) -> Option<ReorgPlan> {
        let common_ancestor = self.fork_point(target)?;
        let rewind = self.headers[(common_ancestor.height as usize + 1)..]
            .iter()
            .rev()
            .cloned()
            .collect();
        let advance = target.headers[(common_ancestor.height as usize + 1)..]
            .to_vec();
        Some(ReorgPlan { common_ancestor, rewind, advance })
    }
}
