//! Target chain selection: the greatest-cumulative-work header chain whose
//! ancestry is free of blacklisted blocks.
//!
//! Recomputation is incremental: a freshly indexed header only competes if
//! it carries strictly more work than the current target tip (which gives
//! first-seen tie-breaking for free). An invalidation inside the current
//! target triggers a full rescan over the index.

use std::sync::Arc;

use parking_lot::RwLock;

use karst_core::error::KarstError;
use karst_core::types::{ChainedHeader, Hash256};

use crate::chain::Chain;
use crate::events::{CoreEvent, EventBus};
use crate::index::ChainIndex;
use crate::invalid::InvalidBlockCache;

pub struct TargetChainSelector {
    index: Arc<ChainIndex>,
    invalid: Arc<InvalidBlockCache>,
    /// Atomically replaced on tip change; readers clone the Arc.
    target: RwLock<Arc<Chain>>,
    events: EventBus,
}

impl TargetChainSelector {
    /// Build the selector and pick the best tip already in the index.
    pub fn new(
        index: Arc<ChainIndex>,
        invalid: Arc<InvalidBlockCache>,
        events: EventBus,
    ) -> Result<Self, KarstError> {
        let genesis_chain = Arc::new(index.chain_to(&index.genesis().hash)?);
        let selector = Self { index, invalid, target: RwLock::new(genesis_chain), events };
        selector.rescan()?;
        Ok(selector)
    }

    /// The current target chain.
    pub fn target_chain(&self) -> Arc<Chain> {
        Arc::clone(&self.target.read())
    }

    /// React to a newly indexed header.
    ///
    /// Only a strictly greater total work can displace the current target;
    /// an equal-work candidate loses to the first-seen tip.
    pub fn on_header_indexed(&self, candidate: &Arc<ChainedHeader>) -> Result<(), KarstError> {
        let current = self.target_chain();
        if candidate.total_work <= current.tip().total_work {
            return Ok(());
        }
        if self.ancestry_valid(candidate)? {
            self.adopt(candidate)?;
        }
        // A poisoned candidate was just transitively blacklisted; the
        // current target was already the best valid chain and stays.
        Ok(())
    }

    /// React to a block being added to the invalid-block cache.
    pub fn on_block_invalidated(&self, hash: &Hash256) -> Result<(), KarstError> {
        let current = self.target_chain();
        let poisoned = self
            .index
            .get(hash)
            .is_some_and(|header| current.contains(&header));
        if poisoned {
            self.rescan()?;
        }
        Ok(())
    }

    /// Full sweep over the index for the best valid tip. Used at startup
    /// and after the current target is poisoned.
    fn rescan(&self) -> Result<(), KarstError> {
        let current = self.target_chain();
        let current_valid = self.ancestry_valid(current.tip())?;

        let mut candidates = self.index.all_headers();
        candidates.sort_by(|a, b| b.total_work.cmp(&a.total_work));

        for candidate in candidates {
            if current_valid && candidate.total_work <= current.tip().total_work {
                // Nothing valid beats a still-valid current target.
                return Ok(());
            }
            if self.ancestry_valid(&candidate)? {
                if candidate.hash != current.tip().hash {
                    self.adopt(&candidate)?;
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Check a header's full ancestry against the blacklist. On a hit,
    /// every strict descendant on the walked path is blacklisted too.
    fn ancestry_valid(&self, header: &Arc<ChainedHeader>) -> Result<bool, KarstError> {
        let mut descendants: Vec<Hash256> = Vec::new();
        for ancestor in self.index.walk_ancestors(&header.hash) {
            if self.invalid.contains(&ancestor.hash) {
                for hash in descendants {
                    self.invalid.add(hash, "descends from an invalid block")?;
                }
                return Ok(false);
            }
            descendants.push(ancestor.hash);
        }
        Ok(true)
    }

    fn adopt(&self, tip: &Arc<ChainedHeader>) -> Result<(), KarstError> {
        let chain = Arc::new(self.index.chain_to(&tip.hash)?);
        {
            let mut guard = self.target.write();
            if guard.tip().hash == tip.hash {
                return Ok(());
            }
            *guard = Arc::clone(&chain);
        }
        tracing::info!(
            tip = %tip.hash,
            height = tip.height,
            "target chain changed"
        );
        self.events.publish(CoreEvent::TargetBlockChanged {
            hash: tip.hash,
            height: tip.height,
        });
        self.events.publish(CoreEvent::TargetChainChanged {
            tip: tip.hash,
            height: tip.height,
        });
        Ok(())
    }
}
