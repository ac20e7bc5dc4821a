//! Storage contracts: transactional cursors over the chain state and the
//! mempool, plus the header index and invalid-block stores.
//!
//! A cursor is a scoped transaction. Dropping it without calling
//! [`commit`](ChainStateCursor::commit) rolls back every staged mutation;
//! there is no explicit rollback call. At most one write cursor exists at a
//! time per store — the backend blocks a second writer until the first
//! commits or drops. Whether readers may run alongside the writer is
//! reported by [`StorageBackend::supports_concurrent_readers`].
//!
//! [`MemoryBackend`] is the reference implementation used by unit tests;
//! the production node uses RocksDB (karst-node).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::StorageError;
use crate::types::{
    BlockUndo, ChainedHeader, Hash256, OutputState, TxOutput, TxOutputKey, UnconfirmedTx,
    UnspentTx,
};

type WriteGate = parking_lot::lock_api::ArcMutexGuard<parking_lot::RawMutex, ()>;

/// Transactional view of the chain state (UTXO set, tip, undo data).
pub trait ChainStateCursor: Send {
    fn read_only(&self) -> bool;

    /// Current chain tip, `None` before genesis is applied.
    fn chain_tip(&self) -> Result<Option<(u32, Hash256)>, StorageError>;
    fn set_chain_tip(&mut self, tip: Option<(u32, Hash256)>) -> Result<(), StorageError>;

    fn unspent_tx_count(&self) -> Result<u64, StorageError>;
    fn set_unspent_tx_count(&mut self, count: u64) -> Result<(), StorageError>;

    fn try_get_unspent_tx(&self, tx_hash: &Hash256) -> Result<Option<UnspentTx>, StorageError>;

    /// Insert a UTXO row. Returns `false` if one already exists for the
    /// hash (BIP30-style refusal; the caller decides how to react).
    fn try_add_unspent_tx(
        &mut self,
        tx_hash: &Hash256,
        row: &UnspentTx,
    ) -> Result<bool, StorageError>;

    /// Replace an existing row. Returns `false` if it does not exist.
    fn try_update_unspent_tx(
        &mut self,
        tx_hash: &Hash256,
        row: &UnspentTx,
    ) -> Result<bool, StorageError>;

    fn try_remove_unspent_tx(&mut self, tx_hash: &Hash256) -> Result<bool, StorageError>;

    fn try_get_unspent_output(&self, key: &TxOutputKey)
        -> Result<Option<TxOutput>, StorageError>;
    fn try_add_unspent_output(
        &mut self,
        key: &TxOutputKey,
        output: &TxOutput,
    ) -> Result<bool, StorageError>;
    fn try_remove_unspent_output(&mut self, key: &TxOutputKey) -> Result<bool, StorageError>;

    /// Flip one output to Spent, returning its previous state. `None` when
    /// the owning row or the index is unknown.
    fn try_spend_output(
        &mut self,
        key: &TxOutputKey,
    ) -> Result<Option<OutputState>, StorageError> {
        let Some(mut row) = self.try_get_unspent_tx(&key.tx_hash)? else {
            return Ok(None);
        };
        let Some(previous) = row.output_states.state(key.index) else {
            return Ok(None);
        };
        row.output_states.set(key.index, OutputState::Spent);
        self.try_update_unspent_tx(&key.tx_hash, &row)?;
        Ok(Some(previous))
    }

    /// Flip one output back to Unspent, returning its previous state.
    fn try_unspend_output(
        &mut self,
        key: &TxOutputKey,
    ) -> Result<Option<OutputState>, StorageError> {
        let Some(mut row) = self.try_get_unspent_tx(&key.tx_hash)? else {
            return Ok(None);
        };
        let Some(previous) = row.output_states.state(key.index) else {
            return Ok(None);
        };
        row.output_states.set(key.index, OutputState::Unspent);
        self.try_update_unspent_tx(&key.tx_hash, &row)?;
        Ok(Some(previous))
    }

    fn block_undo(&self, block: &Hash256) -> Result<Option<BlockUndo>, StorageError>;
    fn put_block_undo(&mut self, block: &Hash256, undo: &BlockUndo) -> Result<(), StorageError>;
    fn remove_block_undo(&mut self, block: &Hash256) -> Result<bool, StorageError>;

    /// Snapshot of every UTXO row. For tests and consistency audits.
    fn unspent_txs(&self) -> Result<Vec<(Hash256, UnspentTx)>, StorageError>;

    /// Atomically publish the staged mutations.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Transactional view of the persisted mempool.
pub trait MempoolCursor: Send {
    fn chain_tip(&self) -> Result<Option<(u32, Hash256)>, StorageError>;
    fn set_chain_tip(&mut self, tip: Option<(u32, Hash256)>) -> Result<(), StorageError>;

    fn get_tx(&self, txid: &Hash256) -> Result<Option<UnconfirmedTx>, StorageError>;
    fn put_tx(&mut self, tx: &UnconfirmedTx) -> Result<(), StorageError>;
    fn remove_tx(&mut self, txid: &Hash256) -> Result<bool, StorageError>;

    /// Record `txid` as a spender of `key` in the multi-valued index.
    fn add_spender(&mut self, key: &TxOutputKey, txid: &Hash256) -> Result<(), StorageError>;
    fn remove_spender(&mut self, key: &TxOutputKey, txid: &Hash256)
        -> Result<bool, StorageError>;
    fn spenders(&self, key: &TxOutputKey) -> Result<Vec<Hash256>, StorageError>;

    /// All stored transactions, for rebuilding the in-memory view on open.
    fn txs(&self) -> Result<Vec<UnconfirmedTx>, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Persistent header index: hash → (header, height, total work).
pub trait HeaderStore: Send + Sync {
    fn put(&self, chained: &ChainedHeader) -> Result<(), StorageError>;
    fn load_all(&self) -> Result<Vec<ChainedHeader>, StorageError>;
}

/// Durable set of invalid block hashes with human-readable reasons.
pub trait InvalidBlockStore: Send + Sync {
    fn put(&self, hash: &Hash256, reason: &str) -> Result<(), StorageError>;
    fn load_all(&self) -> Result<Vec<(Hash256, String)>, StorageError>;
}

/// Factory for the four persistent stores of the core.
pub trait StorageBackend: Send + Sync + 'static {
    fn begin_chain_state(
        &self,
        read_only: bool,
    ) -> Result<Box<dyn ChainStateCursor>, StorageError>;
    fn begin_mempool(&self) -> Result<Box<dyn MempoolCursor>, StorageError>;
    fn header_index(&self) -> Arc<dyn HeaderStore>;
    fn invalid_block_cache(&self) -> Arc<dyn InvalidBlockStore>;
    fn supports_concurrent_readers(&self) -> bool;
}

// ---------------------------------------------------------------------------
// In-memory reference backend
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct ChainStateData {
    tip: Option<(u32, Hash256)>,
    unspent_tx_count: u64,
    unspent_txs: HashMap<Hash256, UnspentTx>,
    outputs: HashMap<TxOutputKey, TxOutput>,
    undo: HashMap<Hash256, BlockUndo>,
}

#[derive(Clone, Debug, Default)]
struct MempoolData {
    tip: Option<(u32, Hash256)>,
    txs: HashMap<Hash256, UnconfirmedTx>,
    spenders: HashMap<TxOutputKey, BTreeSet<Hash256>>,
}

/// In-memory [`StorageBackend`] for tests. Clone-stage-swap transactions,
/// no persistence.
#[derive(Default)]
pub struct MemoryBackend {
    chain: Arc<RwLock<ChainStateData>>,
    chain_write_gate: Arc<Mutex<()>>,
    mempool: Arc<RwLock<MempoolData>>,
    mempool_write_gate: Arc<Mutex<()>>,
    headers: Arc<MemoryHeaderStore>,
    invalid: Arc<MemoryInvalidBlockStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn begin_chain_state(
        &self,
        read_only: bool,
    ) -> Result<Box<dyn ChainStateCursor>, StorageError> {
        let gate = if read_only {
            None
        } else {
            Some(self.chain_write_gate.lock_arc())
        };
        let staged = self.chain.read().clone();
        Ok(Box::new(MemoryChainStateCursor {
            shared: Arc::clone(&self.chain),
            staged,
            gate,
        }))
    }

    fn begin_mempool(&self) -> Result<Box<dyn MempoolCursor>, StorageError> {
        let gate = self.mempool_write_gate.lock_arc();
        let staged = self.mempool.read().clone();
        Ok(Box::new(MemoryMempoolCursor {
            shared: Arc::clone(&self.mempool),
            staged,
            _gate: gate,
        }))
    }

    fn header_index(&self) -> Arc<dyn HeaderStore> {
        Arc::clone(&self.headers) as Arc<dyn HeaderStore>
    }

    fn invalid_block_cache(&self) -> Arc<dyn InvalidBlockStore> {
        Arc::clone(&self.invalid) as Arc<dyn InvalidBlockStore>
    }

    fn supports_concurrent_readers(&self) -> bool {
        true
    }
}

struct MemoryChainStateCursor {
    shared: Arc<RwLock<ChainStateData>>,
    staged: ChainStateData,
    /// Held for the cursor's lifetime by writers; `None` marks read-only.
    gate: Option<WriteGate>,
}

impl MemoryChainStateCursor {
    fn check_writable(&self) -> Result<(), StorageError> {
        if self.gate.is_some() { Ok(()) } else { Err(StorageError::ReadOnly) }
    }
}

impl ChainStateCursor for MemoryChainStateCursor {
    fn read_only(&self) -> bool {
        self.gate.is_none()
    }

    fn chain_tip(&self) -> Result<Option<(u32, Hash256)>, StorageError> {
        Ok(self.staged.tip)
    }

    fn set_chain_tip(&mut self, tip: Option<(u32, Hash256)>) -> Result<(), StorageError> {
        self.check_writable()?;
        self.staged.tip = tip;
        Ok(())
    }

    fn unspent_tx_count(&self) -> Result<u64, StorageError> {
        Ok(self.staged.unspent_tx_count)
    }

    fn set_unspent_tx_count(&mut self, count: u64) -> Result<(), StorageError> {
        self.check_writable()?;
        self.staged.unspent_tx_count = count;
        Ok(())
    }

    fn try_get_unspent_tx(&self, tx_hash: &Hash256) -> Result<Option<UnspentTx>, StorageError> {
        Ok(self.staged.unspent_txs.get(tx_hash).cloned())
    }

    fn try_add_unspent_tx(
        &mut self,
        tx_hash: &Hash256,
        row: &UnspentTx,
    ) -> Result<bool, StorageError> {
        self.check_writable()?;
        if self.staged.unspent_txs.contains_key(tx_hash) {
            return Ok(false);
        }
        self.staged.unspent_txs.insert(*tx_hash, row.clone());
        Ok(true)
    }

    fn try_update_unspent_tx(
        &mut self,
        tx_hash: &Hash256,
        row: &UnspentTx,
    ) -> Result<bool, StorageError> {
        self.check_writable()?;
        match self.staged.unspent_txs.get_mut(tx_hash) {
            Some(existing) => {
                *existing = row.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn try_remove_unspent_tx(&mut self, tx_hash: &Hash256) -> Result<bool, StorageError> {
        self.check_writable()?;
        Ok(self.staged.unspent_txs.remove(tx_hash).is_some())
    }

    fn try_get_unspent_output(
        &self,
        key: &TxOutputKey,
    ) -> Result<Option<TxOutput>, StorageError> {
        Ok(self.staged.outputs.get(key).cloned())
    }

    fn try_add_unspent_output(
        &mut self,
        key: &TxOutputKey,
        output: &TxOutput,
    ) -> Result<bool, StorageError> {
        self.check_writable()?;
        if self.staged.outputs.contains_key(key) {
            return Ok(false);
        }
        self.staged.outputs.insert(*key, output.clone());
        Ok(true)
    }

    fn try_remove_unspent_output(&mut self, key: &TxOutputKey) -> Result<bool, StorageError> {
        self.check_writable()?;
        Ok(self.staged.outputs.remove(key).is_some())
    }

    fn block_undo(&self, block: &Hash256) -> Result<Option<BlockUndo>, StorageError> {
        Ok(self.staged.undo.get(block).cloned())
    }

    fn put_block_undo(&mut self, block: &Hash256, undo: &BlockUndo) -> Result<(), StorageError> {
        self.check_writable()?;
        self.staged.undo.insert(*block, undo.clone());
        Ok(())
    }

    fn remove_block_undo(&mut self, block: &Hash256) -> Result<bool, StorageError> {
        self.check_writable()?;
        Ok(self.staged.undo.remove(block).is_some())
    }

    fn unspent_txs(&self) -> Result<Vec<(Hash256, UnspentTx)>, StorageError> {
        Ok(self.staged.unspent_txs.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.check_writable()?;
        *self.shared.write() = self.staged;
        Ok(())
    }
}

struct MemoryMempoolCursor {
    shared: Arc<RwLock<MempoolData>>,
    staged: MempoolData,
    _gate: WriteGate,
}

impl MempoolCursor for MemoryMempoolCursor {
    fn chain_tip(&self) -> Result<Option<(u32, Hash256)>, StorageError> {
        Ok(self.staged.tip)
    }

    fn set_chain_tip(&mut self, tip: Option<(u32, Hash256)>) -> Result<(), StorageError> {
        self.staged.tip = tip;
        Ok(())
    }

    fn get_tx(&self, txid: &Hash256) -> Result<Option<UnconfirmedTx>, StorageError> {
        Ok(self.staged.txs.get(txid).cloned())
    }

    fn put_tx(&mut self, tx: &UnconfirmedTx) -> Result<(), StorageError> {
        self.staged.txs.insert(tx.txid, tx.clone());
        Ok(())
    }

    fn remove_tx(&mut self, txid: &Hash256) -> Result<bool, StorageError> {
        Ok(self.staged.txs.remove(txid).is_some())
    }

    fn add_spender(&mut self, key: &TxOutputKey, txid: &Hash256) -> Result<(), StorageError> {
        self.staged.spenders.entry(*key).or_default().insert(*txid);
        Ok(())
    }

    fn remove_spender(
        &mut self,
        key: &TxOutputKey,
        txid: &Hash256,
    ) -> Result<bool, StorageError> {
        let Some(set) = self.staged.spenders.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(txid);
        if set.is_empty() {
            self.staged.spenders.remove(key);
        }
        Ok(removed)
    }

    fn spenders(&self, key: &TxOutputKey) -> Result<Vec<Hash256>, StorageError> {
        Ok(self
            .staged
            .spenders
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn txs(&self) -> Result<Vec<UnconfirmedTx>, StorageError> {
        Ok(self.staged.txs.values().cloned().collect())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        *self.shared.write() = self.staged;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryHeaderStore {
    headers: RwLock<HashMap<Hash256, ChainedHeader>>,
}

impl HeaderStore for MemoryHeaderStore {
    fn put(&self, chained: &ChainedHeader) -> Result<(), StorageError> {
        self.headers.write().insert(chained.hash, chained.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ChainedHeader>, StorageError> {
        Ok(self.headers.read().values().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryInvalidBlockStore {
    blocks: RwLock<HashMap<Hash256, String>>,
}

impl InvalidBlockStore for MemoryInvalidBlockStore {
    fn put(&self, hash: &Hash256, reason: &str) -> Result<(), StorageError> {
        self.blocks.write().insert(*hash, reason.to_string());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(Hash256, String)>, StorageError> {
        Ok(self.blocks.read().iter().map(|(k, v)| (*k, v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8, index: u32) -> TxOutputKey {
        TxOutputKey::new(Hash256([seed; 32]), index)
    }

    fn output(value: u64) -> TxOutput {
        TxOutput { value, script_pubkey: vec![0x51] }
    }

    #[test]
    fn fresh_backend_is_empty() {
        let backend = MemoryBackend::new();
        let cursor = backend.begin_chain_state(true).unwrap();
        assert!(cursor.read_only());
        assert_eq!(cursor.chain_tip().unwrap(), None);
        assert_eq!(cursor.unspent_tx_count().unwrap(), 0);
        assert!(cursor.unspent_txs().unwrap().is_empty());
    }

    #[test]
    fn read_only_cursor_rejects_writes() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_chain_state(true).unwrap();
        assert_eq!(
            cursor.set_chain_tip(Some((0, Hash256::ZERO))).unwrap_err(),
            StorageError::ReadOnly,
        );
        assert_eq!(
            cursor.try_add_unspent_tx(&Hash256::ZERO, &UnspentTx::new(0, 0, 1)).unwrap_err(),
            StorageError::ReadOnly,
        );
    }

    #[test]
    fn commit_publishes_staged_writes() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_chain_state(false).unwrap();
        cursor.set_chain_tip(Some((3, Hash256([1; 32])))).unwrap();
        cursor.try_add_unspent_tx(&Hash256([2; 32]), &UnspentTx::new(3, 1, 2)).unwrap();
        cursor.set_unspent_tx_count(1).unwrap();
        cursor.commit().unwrap();

        let cursor = backend.begin_chain_state(true).unwrap();
        assert_eq!(cursor.chain_tip().unwrap(), Some((3, Hash256([1; 32]))));
        assert_eq!(cursor.unspent_tx_count().unwrap(), 1);
        assert!(cursor.try_get_unspent_tx(&Hash256([2; 32])).unwrap().is_some());
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let backend = MemoryBackend::new();
        {
            let mut cursor = backend.begin_chain_state(false).unwrap();
            cursor.set_chain_tip(Some((7, Hash256([7; 32])))).unwrap();
            // Dropped here without commit.
        }
        let cursor = backend.begin_chain_state(true).unwrap();
        assert_eq!(cursor.chain_tip().unwrap(), None);
    }

    #[test]
    fn add_unspent_tx_refuses_duplicates() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_chain_state(false).unwrap();
        let hash = Hash256([5; 32]);
        assert!(cursor.try_add_unspent_tx(&hash, &UnspentTx::new(1, 0, 1)).unwrap());
        assert!(!cursor.try_add_unspent_tx(&hash, &UnspentTx::new(2, 0, 1)).unwrap());
    }

    #[test]
    fn spend_output_flips_state_and_reports_previous() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_chain_state(false).unwrap();
        let hash = Hash256([5; 32]);
        cursor.try_add_unspent_tx(&hash, &UnspentTx::new(1, 1, 2)).unwrap();

        let k = TxOutputKey::new(hash, 0);
        assert_eq!(cursor.try_spend_output(&k).unwrap(), Some(OutputState::Unspent));
        // Second spend observes the flipped state.
        assert_eq!(cursor.try_spend_output(&k).unwrap(), Some(OutputState::Spent));
        // Other output untouched.
        let row = cursor.try_get_unspent_tx(&hash).unwrap().unwrap();
        assert_eq!(row.output_states.state(1), Some(OutputState::Unspent));
    }

    #[test]
    fn spend_unknown_output_returns_none() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_chain_state(false).unwrap();
        assert_eq!(cursor.try_spend_output(&key(9, 0)).unwrap(), None);

        let hash = Hash256([5; 32]);
        cursor.try_add_unspent_tx(&hash, &UnspentTx::new(1, 1, 1)).unwrap();
        // Index out of range for the row.
        assert_eq!(cursor.try_spend_output(&TxOutputKey::new(hash, 7)).unwrap(), None);
    }

    #[test]
    fn unspend_restores_state() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_chain_state(false).unwrap();
        let hash = Hash256([5; 32]);
        cursor.try_add_unspent_tx(&hash, &UnspentTx::new(1, 1, 1)).unwrap();
        let k = TxOutputKey::new(hash, 0);
        cursor.try_spend_output(&k).unwrap();
        assert_eq!(cursor.try_unspend_output(&k).unwrap(), Some(OutputState::Spent));
        let row = cursor.try_get_unspent_tx(&hash).unwrap().unwrap();
        assert!(row.output_states.all_unspent());
    }

    #[test]
    fn output_side_table_round_trip() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_chain_state(false).unwrap();
        let k = key(1, 0);
        assert!(cursor.try_add_unspent_output(&k, &output(42)).unwrap());
        assert!(!cursor.try_add_unspent_output(&k, &output(43)).unwrap());
        assert_eq!(cursor.try_get_unspent_output(&k).unwrap().unwrap().value, 42);
        assert!(cursor.try_remove_unspent_output(&k).unwrap());
        assert_eq!(cursor.try_get_unspent_output(&k).unwrap(), None);
    }

    #[test]
    fn block_undo_round_trip() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_chain_state(false).unwrap();
        let block = Hash256([3; 32]);
        let undo = BlockUndo::default();
        cursor.put_block_undo(&block, &undo).unwrap();
        assert_eq!(cursor.block_undo(&block).unwrap(), Some(undo));
        assert!(cursor.remove_block_undo(&block).unwrap());
        assert_eq!(cursor.block_undo(&block).unwrap(), None);
    }

    #[test]
    fn mempool_spender_index_is_multi_valued() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.begin_mempool().unwrap();
        let k = key(1, 0);
        cursor.add_spender(&k, &Hash256([0xA; 32])).unwrap();
        cursor.add_spender(&k, &Hash256([0xB; 32])).unwrap();
        assert_eq!(cursor.spenders(&k).unwrap().len(), 2);
        assert!(cursor.remove_spender(&k, &Hash256([0xA; 32])).unwrap());
        assert_eq!(cursor.spenders(&k).unwrap(), vec![Hash256([0xB; 32])]);
        assert!(!cursor.remove_spender(&k, &Hash256([0xA; 32])).unwrap());
    }

    #[test]
    fn mempool_commit_and_rollback() {
        let backend = MemoryBackend::new();
        {
            let mut cursor = backend.begin_mempool().unwrap();
            cursor.set_chain_tip(Some((1, Hash256([1; 32])))).unwrap();
            cursor.commit().unwrap();
        }
        {
            let mut cursor = backend.begin_mempool().unwrap();
            cursor.set_chain_tip(Some((9, Hash256([9; 32])))).unwrap();
            // Dropped without commit.
        }
        let cursor = backend.begin_mempool().unwrap();
        assert_eq!(cursor.chain_tip().unwrap(), Some((1, Hash256([1; 32]))));
    }

    #[test]
    fn header_store_round_trip() {
        let backend = MemoryBackend::new();
        let store = backend.header_index();
        let chained = ChainedHeader::genesis(crate::genesis::genesis_header());
        store.put(&chained).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], chained);
    }

    #[test]
    fn invalid_block_store_round_trip() {
        let backend = MemoryBackend::new();
        let store = backend.invalid_block_cache();
        store.put(&Hash256([1; 32]), "bad subsidy").unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![(Hash256([1; 32]), "bad subsidy".to_string())]);
    }
}
