//! Append-only header index: hash → chained header.
//!
//! Headers are chained (height and cumulative work assigned) on insert and
//! never removed within a run; invalid blocks are handled by the separate
//! invalid-block cache so the index can stay lock-free for readers.
//! Inserts write through to the persistent header store, and the whole
//! index is reloaded from it on open.

use std::sync::Arc;

use dashmap::DashMap;

use karst_core::difficulty;
use karst_core::error::{ChainIndexError, KarstError, StorageError};
use karst_core::store::HeaderStore;
use karst_core::types::{BlockHeader, ChainedHeader, Hash256};
use karst_core::work;

use crate::chain::Chain;

pub struct ChainIndex {
    headers: DashMap<Hash256, Arc<ChainedHeader>>,
    genesis: Arc<ChainedHeader>,
    store: Arc<dyn HeaderStore>,
}

impl ChainIndex {
    /// Open the index over a header store, anchoring on `genesis_header`.
    ///
    /// Persisted headers are reloaded; a fresh store gets the genesis
    /// written through.
    pub fn open(
        store: Arc<dyn HeaderStore>,
        genesis_header: BlockHeader,
    ) -> Result<Self, KarstError> {
        let genesis = Arc::new(ChainedHeader::genesis(genesis_header));
        let headers = DashMap::new();

        let mut genesis_persisted = false;
        for chained in store.load_all()? {
            if chained.hash == genesis.hash {
                genesis_persisted = true;
            }
            headers.insert(chained.hash, Arc::new(chained));
        }
        headers.insert(genesis.hash, Arc::clone(&genesis));
        if !genesis_persisted {
            store.put(&genesis)?;
        }

        Ok(Self { headers, genesis, store })
    }

    pub fn genesis(&self) -> Arc<ChainedHeader> {
        Arc::clone(&self.genesis)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Chain a header onto its indexed parent and persist it.
    ///
    /// Re-inserting a known header returns the existing entry. The parent
    /// must already be indexed, and the header's bits must encode a real
    /// target — otherwise its work contribution would be zero and
    /// cumulative work would not strictly increase.
    pub fn insert(&self, header: BlockHeader) -> Result<Arc<ChainedHeader>, KarstError> {
        let hash = header.hash();
        if let Some(existing) = self.headers.get(&hash) {
            return Ok(Arc::clone(existing.value()));
        }

        let parent = self
            .headers
            .get(&header.prev_hash)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ChainIndexError::UnknownParent(hash))?;

        if work::work_from_bits(header.bits).is_zero() {
            return Err(ChainIndexError::InvalidWork(hash).into());
        }

        let chained = Arc::new(ChainedHeader::from_parent(&parent, header));
        debug_assert!(chained.total_work > parent.total_work);

        self.store.put(&chained)?;
        self.headers.insert(hash, Arc::clone(&chained));
        Ok(chained)
    }

    pub fn get(&self, hash: &Hash256) -> Option<Arc<ChainedHeader>> {
        self.headers.get(hash).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.headers.contains_key(hash)
    }

    /// Lazy walk from `hash` back to genesis, inclusive on both ends.
    pub fn walk_ancestors(&self, hash: &Hash256) -> Ancestors<'_> {
        Ancestors { index: self, next: self.get(hash) }
    }

    /// Deepest shared ancestor of two indexed headers, by equal-height
    /// rewind.
    pub fn find_common_ancestor(
        &self,
        a: &Hash256,
        b: &Hash256,
    ) -> Result<Arc<ChainedHeader>, KarstError> {
        let mut a = self.get(a).ok_or(ChainIndexError::UnknownHeader(*a))?;
        let mut b = self.get(b).ok_or(ChainIndexError::UnknownHeader(*b))?;

        while a.height > b.height {
            a = self.parent_of(&a)?;
        }
        while b.height > a.height {
            b = self.parent_of(&b)?;
        }
        while a.hash != b.hash {
            a = self.parent_of(&a)?;
            b = self.parent_of(&b)?;
        }
        Ok(a)
    }

    /// Materialize the chain from genesis to `tip`.
    pub fn chain_to(&self, tip: &Hash256) -> Result<Chain, KarstError> {
        let mut headers: Vec<Arc<ChainedHeader>> = self.walk_ancestors(tip).collect();
        if headers.is_empty() {
            return Err(ChainIndexError::UnknownHeader(*tip).into());
        }
        headers.reverse();
        if headers[0].hash != self.genesis.hash {
            // The walk ran out before genesis: a persisted header whose
            // ancestry is missing from the store.
            return Err(StorageError::Corrupt(format!(
                "header {tip} does not reach genesis"
            ))
            .into());
        }
        Ok(Chain::new(headers))
    }

    /// Bits the difficulty schedule pins for a child of `parent`.
    ///
    /// `None` off retarget boundaries — the schedule only constrains the
    /// target at window edges.
    pub fn expected_bits(&self, parent: &ChainedHeader) -> Result<Option<u32>, KarstError> {
        let height = parent.height + 1;
        if !difficulty::is_retarget_height(height) {
            return Ok(None);
        }
        let start_height = difficulty::window_start_height(height);
        let start = self
            .walk_ancestors(&parent.hash)
            .find(|h| h.height == start_height)
            .ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "retarget window start {start_height} missing below {}",
                    parent.hash
                ))
            })?;
        Ok(Some(difficulty::retarget_bits(
            parent.header.bits,
            start.header.time,
            parent.header.time,
        )))
    }

    /// Every indexed header. The selector uses this for full rescans after
    /// an invalidation.
    pub fn all_headers(&self) -> Vec<Arc<ChainedHeader>> {
        self.headers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn parent_of(&self, header: &ChainedHeader) -> Result<Arc<ChainedHeader>, KarstError> {
        self.get(&header.header.prev_hash)
            .ok_or_else(|| ChainIndexError::UnknownHeader(header.header.prev_hash).into())
    }
}

/// Iterator from a header back to genesis.
pub struct Ancestors<'a> {
    index: &'a ChainIndex,
    next: Option<Arc<ChainedHeader>>,
}

impl Iterator for Ancestors<'_> {
    type Item = Arc<ChainedHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        if current.height > 0 {
            self.next = self.index.get(&current.header.prev_hash);
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_core::constants::POW_LIMIT_BITS;
    use karst_core::genesis::genesis_header;
    use karst_core::store::MemoryHeaderStore;

    fn open_index() -> ChainIndex {
        ChainIndex::open(Arc::new(MemoryHeaderStore::default()), genesis_header()).unwrap()
    }

    fn child_header(parent: &ChainedHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: parent.hash,
            merkle_root: Hash256::ZERO,
            time: parent.header.time + 600,
            bits: POW_LIMIT_BITS,
            nonce,
        }
    }

    #[test]
    fn open_anchors_genesis() {
        let index = open_index();
        assert_eq!(index.len(), 1);
        let genesis = index.genesis();
        assert_eq!(genesis.height, 0);
        assert!(index.contains(&genesis.hash));
    }

    #[test]
    fn insert_assigns_height_and_work() {
        let index = open_index();
        let genesis = index.genesis();
        let chained = index.insert(child_header(&genesis, 1)).unwrap();
        assert_eq!(chained.height, 1);
        assert!(chained.total_work > genesis.total_work);
    }

    #[test]
    fn insert_unknown_parent_fails() {
        let index = open_index();
        let orphan = BlockHeader {
            version: 1,
            prev_hash: Hash256([0xEE; 32]),
            merkle_root: Hash256::ZERO,
            time: 0,
            bits: POW_LIMIT_BITS,
            nonce: 0,
        };
        let err = index.insert(orphan).unwrap_err();
        assert!(matches!(err, KarstError::ChainIndex(ChainIndexError::UnknownParent(_))));
    }

    #[test]
    fn insert_unencodable_bits_fails() {
        let index = open_index();
        let genesis = index.genesis();
        let mut header = child_header(&genesis, 1);
        header.bits = 0x0080_0000; // sign bit set: no valid target
        let err = index.insert(header).unwrap_err();
        assert!(matches!(err, KarstError::ChainIndex(ChainIndexError::InvalidWork(_))));
    }

    #[test]
    fn insert_is_idempotent() {
        let index = open_index();
        let genesis = index.genesis();
        let header = child_header(&genesis, 1);
        let first = index.insert(header).unwrap();
        let second = index.insert(header).unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn walk_ancestors_terminates_at_genesis() {
        let index = open_index();
        let mut tip = index.genesis();
        for nonce in 0..5 {
            tip = index.insert(child_header(&tip, nonce)).unwrap();
        }
        let walked: Vec<u32> = index.walk_ancestors(&tip.hash).map(|h| h.height).collect();
        assert_eq!(walked, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn common_ancestor_of_fork() {
        let index = open_index();
        let genesis = index.genesis();
        let shared = index.insert(child_header(&genesis, 1)).unwrap();
        // Branch a: two blocks, branch b: one block.
        let a1 = index.insert(child_header(&shared, 10)).unwrap();
        let a2 = index.insert(child_header(&a1, 11)).unwrap();
        let b1 = index.insert(child_header(&shared, 20)).unwrap();

        let ancestor = index.find_common_ancestor(&a2.hash, &b1.hash).unwrap();
        assert_eq!(ancestor.hash, shared.hash);
    }

    #[test]
    fn common_ancestor_of_linear_chain_is_lower_header() {
        let index = open_index();
        let genesis = index.genesis();
        let h1 = index.insert(child_header(&genesis, 1)).unwrap();
        let h2 = index.insert(child_header(&h1, 2)).unwrap();
        let ancestor = index.find_common_ancestor(&h2.hash, &h1.hash).unwrap();
        assert_eq!(ancestor.hash, h1.hash);
    }

    #[test]
    fn chain_to_materializes_in_order() {
        let index = open_index();
        let mut tip = index.genesis();
        for nonce in 0..3 {
            tip = index.insert(child_header(&tip, nonce)).unwrap();
        }
        let chain = index.chain_to(&tip.hash).unwrap();
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.genesis().hash, index.genesis().hash);
        assert_eq!(chain.tip().hash, tip.hash);
    }

    #[test]
    fn reopen_reloads_persisted_headers() {
        let store = Arc::new(MemoryHeaderStore::default());
        let tip_hash;
        {
            let index =
                ChainIndex::open(Arc::clone(&store) as Arc<dyn HeaderStore>, genesis_header())
                    .unwrap();
            let genesis = index.genesis();
            let h1 = index.insert(child_header(&genesis, 1)).unwrap();
            tip_hash = h1.hash;
        }
        let reopened =
            ChainIndex::open(Arc::clone(&store) as Arc<dyn HeaderStore>, genesis_header())
                .unwrap();
        assert_eq!(reopened.len(), 2);
        let reloaded = reopened.get(&tip_hash).unwrap();
        assert_eq!(reloaded.height, 1);
    }

    #[test]
    fn expected_bits_unconstrained_between_boundaries() {
        let index = open_index();
        let genesis = index.genesis();
        assert_eq!(index.expected_bits(&genesis).unwrap(), None);
    }
}
