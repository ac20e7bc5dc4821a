//! The mempool coordinator: unconfirmed transactions kept consistent with
//! the UTXO set.
//!
//! Two locks, per the concurrency contract:
//!
//! - a coarse **update lock** serializing block-apply and block-unwind
//!   against admissions; `try_add` takes it in read mode when the backend
//!   supports concurrent readers, write mode otherwise;
//! - a narrow **commit lock** held only while the durable chain tip and
//!   the in-memory tip swap together, so readers never observe a tip that
//!   disagrees with the persisted state. The two-phase shape (store tip
//!   first, memory pointer second) is deliberate but fragile: a stronger
//!   design would cover both in one storage transaction.
//!
//! The spend index is multi-valued: several pool transactions may spend
//! the same output, and the conflict resolves at confirmation time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use karst_chain::{CoreEvent, EventBus};
use karst_core::error::{KarstError, MempoolReject, StorageError};
use karst_core::types::{
    Block, ChainedHeader, Hash256, OutputState, PrevOutput, Transaction, TxOutputKey,
    UnconfirmedTx,
};
use karst_core::store::{ChainStateCursor as _, MempoolCursor as _, StorageBackend};

#[derive(Default)]
struct PoolState {
    txs: HashMap<Hash256, UnconfirmedTx>,
    /// Output key → pool transactions spending it.
    spenders: HashMap<TxOutputKey, HashSet<Hash256>>,
}

impl PoolState {
    fn insert(&mut self, tx: UnconfirmedTx) {
        for input in &tx.tx.inputs {
            self.spenders.entry(input.prev_output).or_default().insert(tx.txid);
        }
        self.txs.insert(tx.txid, tx);
    }

    fn remove(&mut self, txid: &Hash256) -> Option<UnconfirmedTx> {
        let tx = self.txs.remove(txid)?;
        for input in &tx.tx.inputs {
            if let Some(set) = self.spenders.get_mut(&input.prev_output) {
                set.remove(txid);
                if set.is_empty() {
                    self.spenders.remove(&input.prev_output);
                }
            }
        }
        Some(tx)
    }
}

pub struct MempoolCoordinator {
    backend: Arc<dyn StorageBackend>,
    state: RwLock<PoolState>,
    update_lock: RwLock<()>,
    commit_lock: Mutex<()>,
    /// In-memory chain pointer, swapped under the commit lock.
    chain_tip: RwLock<Option<(u32, Hash256)>>,
    events: EventBus,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl MempoolCoordinator {
    /// Open the coordinator, rebuilding the in-memory view from the
    /// persisted pool.
    pub fn open(backend: Arc<dyn StorageBackend>, events: EventBus) -> Result<Self, KarstError> {
        let mut state = PoolState::default();
        let tip;
        {
            let cursor = backend.begin_mempool()?;
            tip = cursor.chain_tip()?;
            for tx in cursor.txs()? {
                state.insert(tx);
            }
        }
        Ok(Self {
            backend,
            state: RwLock::new(state),
            update_lock: RwLock::new(()),
            commit_lock: Mutex::new(()),
            chain_tip: RwLock::new(tip),
            events,
            clock: Box::new(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
            }),
        })
    }

    /// Swap the wall clock for a deterministic one in tests.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Record the chain tip on a fresh store so the three stores agree at
    /// rest.
    pub fn anchor_tip(&self, tip: (u32, Hash256)) -> Result<(), KarstError> {
        if self.chain_tip.read().is_some() {
            return Ok(());
        }
        let mut cursor = self.backend.begin_mempool()?;
        cursor.set_chain_tip(Some(tip))?;
        {
            let _commit = self.commit_lock.lock();
            cursor.commit()?;
            *self.chain_tip.write() = Some(tip);
        }
        Ok(())
    }

    /// The tip the pool was last reconciled against, consistent with the
    /// persisted value.
    pub fn chain_tip(&self) -> Option<(u32, Hash256)> {
        let _commit = self.commit_lock.lock();
        *self.chain_tip.read()
    }

    pub fn len(&self) -> usize {
        self.state.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().txs.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.state.read().txs.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<UnconfirmedTx> {
        self.state.read().txs.get(txid).cloned()
    }

    /// Pool transactions currently spending `key`.
    pub fn get_spending(&self, key: &TxOutputKey) -> Vec<Hash256> {
        self.state
            .read()
            .spenders
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Validate and admit a transaction against a consistent UTXO
    /// snapshot. Rejections are verdicts ([`MempoolReject`]), not faults.
    pub fn try_add(&self, tx: Transaction) -> Result<Hash256, KarstError> {
        // Admission may run alongside other admissions, but never
        // alongside a block apply or unwind.
        let mut _read = None;
        let mut _write = None;
        if self.backend.supports_concurrent_readers() {
            _read = Some(self.update_lock.read());
        } else {
            _write = Some(self.update_lock.write());
        }

        if tx.is_coinbase() {
            return Err(MempoolReject::Coinbase.into());
        }
        let txid = tx.txid();
        if self.state.read().txs.contains_key(&txid) {
            return Err(MempoolReject::Duplicate(txid).into());
        }

        let cursor = self.backend.begin_chain_state(true)?;
        let mut seen: HashSet<TxOutputKey> = HashSet::with_capacity(tx.inputs.len());
        let mut prev_outputs = Vec::with_capacity(tx.inputs.len());
        let mut total_in: u64 = 0;

        for input in &tx.inputs {
            let key = input.prev_output;
            if !seen.insert(key) {
                return Err(MempoolReject::RepeatedInput(key).into());
            }
            let Some(row) = cursor.try_get_unspent_tx(&key.tx_hash)? else {
                return Err(MempoolReject::UnknownOrSpentInput(key).into());
            };
            if row.output_states.state(key.index) != Some(OutputState::Unspent) {
                return Err(MempoolReject::UnknownOrSpentInput(key).into());
            }
            let Some(output) = cursor.try_get_unspent_output(&key)? else {
                return Err(StorageError::Corrupt(format!(
                    "unspent output {key} has no payload row"
                ))
                .into());
            };
            total_in = total_in
                .checked_add(output.value)
                .ok_or(MempoolReject::ValueOverflow)?;
            prev_outputs.push(PrevOutput {
                output,
                block_height: row.block_height,
                is_coinbase: row.is_coinbase(),
            });
        }

        let total_out = tx.total_output_value().ok_or(MempoolReject::ValueOverflow)?;
        if total_in < total_out {
            return Err(MempoolReject::InsufficientInputValue { total_in, total_out }.into());
        }

        let unconfirmed = UnconfirmedTx {
            txid,
            prev_outputs,
            fee: total_in - total_out,
            admitted_at: (self.clock)(),
            tx,
        };

        let mut mempool_cursor = self.backend.begin_mempool()?;
        mempool_cursor.put_tx(&unconfirmed)?;
        for input in &unconfirmed.tx.inputs {
            mempool_cursor.add_spender(&input.prev_output, &txid)?;
        }
        mempool_cursor.commit()?;

        self.state.write().insert(unconfirmed);
        self.events.publish(CoreEvent::TxAdded { txid });
        Ok(txid)
    }

    /// Reconcile the pool with a block the manager just applied.
    ///
    /// Confirmed transactions leave the pool; pool transactions spending
    /// a prev-output the block consumed are evicted as conflicts.
    pub fn on_block_applied(
        &self,
        header: &ChainedHeader,
        block: &Block,
    ) -> Result<(), KarstError> {
        let _update = self.update_lock.write();

        let mut confirmed: Vec<Hash256> = Vec::new();
        let mut conflicted: Vec<Hash256> = Vec::new();
        {
            let state = self.state.read();
            let block_txids: HashSet<Hash256> =
                block.transactions.iter().map(|tx| tx.txid()).collect();
            for txid in &block_txids {
                if state.txs.contains_key(txid) {
                    confirmed.push(*txid);
                }
            }
            for tx in &block.transactions {
                if tx.is_coinbase() {
                    continue;
                }
                for input in &tx.inputs {
                    if let Some(spenders) = state.spenders.get(&input.prev_output) {
                        for spender in spenders {
                            if !block_txids.contains(spender) && !conflicted.contains(spender) {
                                conflicted.push(*spender);
                            }
                        }
                    }
                }
            }
        }

        let mut cursor = self.backend.begin_mempool()?;
        for txid in confirmed.iter().chain(conflicted.iter()) {
            if let Some(entry) = self.state.read().txs.get(txid) {
                for input in &entry.tx.inputs {
                    cursor.remove_spender(&input.prev_output, txid)?;
                }
            }
            cursor.remove_tx(txid)?;
        }
        cursor.set_chain_tip(Some((header.height, header.hash)))?;

        {
            let _commit = self.commit_lock.lock();
            cursor.commit()?;
            let mut state = self.state.write();
            for txid in confirmed.iter().chain(conflicted.iter()) {
                state.remove(txid);
            }
            *self.chain_tip.write() = Some((header.height, header.hash));
        }

        if !confirmed.is_empty() || !conflicted.is_empty() {
            tracing::debug!(
                block = %header.hash,
                confirmed = confirmed.len(),
                conflicted = conflicted.len(),
                "mempool reconciled with applied block"
            );
        }
        self.events.publish(CoreEvent::TxesConfirmed {
            block: header.hash,
            confirmed,
            conflicted,
        });
        Ok(())
    }

    /// Reconcile the pool with a block the manager just unwound.
    ///
    /// The unwound transactions are *candidates* for re-admission; the
    /// subscriber re-offers them through [`try_add`](Self::try_add).
    pub fn on_block_unwound(
        &self,
        header: &ChainedHeader,
        block: &Block,
    ) -> Result<(), KarstError> {
        let _update = self.update_lock.write();

        let parent = (header.height - 1, header.header.prev_hash);
        let mut cursor = self.backend.begin_mempool()?;
        cursor.set_chain_tip(Some(parent))?;
        {
            let _commit = self.commit_lock.lock();
            cursor.commit()?;
            *self.chain_tip.write() = Some(parent);
        }

        let unconfirmed: Vec<Hash256> = block
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.txid())
            .collect();
        self.events.publish(CoreEvent::TxesUnconfirmed {
            block: header.hash,
            unconfirmed,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_core::constants::COIN;
    use karst_core::store::MemoryBackend;
    use karst_core::types::{TxInput, TxOutput, UnspentTx};

    fn backend_with_utxo(entries: &[(Hash256, u32, u64)]) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        let mut cursor = backend.begin_chain_state(false).unwrap();
        for (hash, outputs, value) in entries {
            cursor.try_add_unspent_tx(hash, &UnspentTx::new(1, 1, *outputs)).unwrap();
            for i in 0..*outputs {
                cursor
                    .try_add_unspent_output(
                        &TxOutputKey::new(*hash, i),
                        &TxOutput { value: *value, script_pubkey: vec![0x51] },
                    )
                    .unwrap();
            }
        }
        cursor.set_chain_tip(Some((1, Hash256([0xCC; 32])))).unwrap();
        cursor.commit().unwrap();
        backend
    }

    fn coordinator(backend: Arc<MemoryBackend>) -> MempoolCoordinator {
        MempoolCoordinator::open(backend, EventBus::new(64))
            .unwrap()
            .with_clock(|| 1_700_000_000)
    }

    fn spend(key: TxOutputKey, value_out: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput { prev_output: key, script_sig: vec![0x51], sequence: u32::MAX }],
            outputs: vec![TxOutput { value: value_out, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn funding() -> (Arc<MemoryBackend>, TxOutputKey) {
        let hash = Hash256([0xAA; 32]);
        (backend_with_utxo(&[(hash, 1, 10 * COIN)]), TxOutputKey::new(hash, 0))
    }

    fn reject(err: KarstError) -> MempoolReject {
        match err {
            KarstError::Mempool(r) => r,
            other => panic!("expected mempool reject, got {other:?}"),
        }
    }

    #[test]
    fn admits_valid_spend_and_caches_prev_outputs() {
        let (backend, key) = funding();
        let pool = coordinator(backend);
        let tx = spend(key, 9 * COIN);
        let txid = pool.try_add(tx).unwrap();

        assert!(pool.contains(&txid));
        let entry = pool.get(&txid).unwrap();
        assert_eq!(entry.fee, COIN);
        assert_eq!(entry.prev_outputs.len(), 1);
        assert_eq!(entry.prev_outputs[0].output.value, 10 * COIN);
        assert_eq!(entry.admitted_at, 1_700_000_000);
        assert_eq!(pool.get_spending(&key), vec![txid]);
    }

    #[test]
    fn rejects_duplicate() {
        let (backend, key) = funding();
        let pool = coordinator(backend);
        pool.try_add(spend(key, 9 * COIN)).unwrap();
        let err = pool.try_add(spend(key, 9 * COIN)).unwrap_err();
        assert!(matches!(reject(err), MempoolReject::Duplicate(_)));
    }

    #[test]
    fn rejects_unknown_input() {
        let (backend, _) = funding();
        let pool = coordinator(backend);
        let err = pool
            .try_add(spend(TxOutputKey::new(Hash256([9; 32]), 0), COIN))
            .unwrap_err();
        assert!(matches!(reject(err), MempoolReject::UnknownOrSpentInput(_)));
    }

    #[test]
    fn rejects_spent_input() {
        let (backend, key) = funding();
        {
            let mut cursor = backend.begin_chain_state(false).unwrap();
            cursor.try_spend_output(&key).unwrap();
            cursor.commit().unwrap();
        }
        let pool = coordinator(backend);
        let err = pool.try_add(spend(key, COIN)).unwrap_err();
        assert!(matches!(reject(err), MempoolReject::UnknownOrSpentInput(_)));
    }

    #[test]
    fn rejects_self_double_spend() {
        let (backend, key) = funding();
        let pool = coordinator(backend);
        let mut tx = spend(key, COIN);
        tx.inputs.push(tx.inputs[0].clone());
        let err = pool.try_add(tx).unwrap_err();
        assert!(matches!(reject(err), MempoolReject::RepeatedInput(_)));
    }

    #[test]
    fn rejects_outputs_above_inputs() {
        let (backend, key) = funding();
        let pool = coordinator(backend);
        let err = pool.try_add(spend(key, 11 * COIN)).unwrap_err();
        assert!(matches!(reject(err), MempoolReject::InsufficientInputValue { .. }));
    }

    #[test]
    fn rejects_coinbase() {
        let (backend, _) = funding();
        let pool = coordinator(backend);
        let cb = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_output: TxOutputKey::coinbase(),
                script_sig: vec![0x01, 0x00],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { value: COIN, script_pubkey: vec![0x51] }],
            lock_time: 0,
        };
        assert!(matches!(reject(pool.try_add(cb).unwrap_err()), MempoolReject::Coinbase));
    }

    #[test]
    fn two_pool_txs_may_spend_the_same_output() {
        // Conflicts are allowed in the pool and resolved at confirmation.
        let (backend, key) = funding();
        let pool = coordinator(backend);
        let a = pool.try_add(spend(key, 9 * COIN)).unwrap();
        let b = pool.try_add(spend(key, 8 * COIN)).unwrap();
        let mut spending = pool.get_spending(&key);
        spending.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(spending, expected);
    }

    #[test]
    fn admissions_survive_reopen() {
        let (backend, key) = funding();
        let txid = {
            let pool = coordinator(Arc::clone(&backend));
            pool.try_add(spend(key, 9 * COIN)).unwrap()
        };
        let reopened = coordinator(backend);
        assert!(reopened.contains(&txid));
        assert_eq!(reopened.get_spending(&key), vec![txid]);
    }

    fn chained(height: u32, hash: Hash256, prev: Hash256) -> ChainedHeader {
        let header = karst_core::types::BlockHeader {
            version: 1,
            prev_hash: prev,
            merkle_root: Hash256::ZERO,
            time: 0,
            bits: karst_core::constants::POW_LIMIT_BITS,
            nonce: 0,
        };
        ChainedHeader {
            header,
            hash,
            height,
            total_work: primitive_types::U256::from(height),
        }
    }

    fn block_with(txs: Vec<Transaction>) -> Block {
        Block {
            header: karst_core::types::BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                time: 0,
                bits: karst_core::constants::POW_LIMIT_BITS,
                nonce: 0,
            },
            transactions: txs,
        }
    }

    #[test]
    fn confirmation_removes_pool_tx_and_updates_tip() {
        let (backend, key) = funding();
        let pool = coordinator(backend);
        let tx = spend(key, 9 * COIN);
        let txid = pool.try_add(tx.clone()).unwrap();

        let header = chained(2, Hash256([0xD2; 32]), Hash256([0xCC; 32]));
        pool.on_block_applied(&header, &block_with(vec![tx])).unwrap();

        assert!(!pool.contains(&txid));
        assert!(pool.get_spending(&key).is_empty());
        assert_eq!(pool.chain_tip(), Some((2, Hash256([0xD2; 32]))));
    }

    #[test]
    fn conflicting_pool_tx_is_evicted_on_confirmation() {
        let (backend, key) = funding();
        let pool = coordinator(backend);
        // Pool holds one spender; the block confirms a different one.
        let pool_txid = pool.try_add(spend(key, 8 * COIN)).unwrap();
        let winner = spend(key, 9 * COIN);

        let header = chained(2, Hash256([0xD2; 32]), Hash256([0xCC; 32]));
        pool.on_block_applied(&header, &block_with(vec![winner])).unwrap();

        assert!(!pool.contains(&pool_txid));
        assert!(pool.is_empty());
    }

    #[test]
    fn unrelated_pool_tx_survives_confirmation() {
        let other = Hash256([0xBB; 32]);
        let backend = backend_with_utxo(&[
            (Hash256([0xAA; 32]), 1, 10 * COIN),
            (other, 1, 5 * COIN),
        ]);
        let pool = coordinator(backend);
        let survivor = pool.try_add(spend(TxOutputKey::new(other, 0), 4 * COIN)).unwrap();
        let confirmed = spend(TxOutputKey::new(Hash256([0xAA; 32]), 0), 9 * COIN);

        let header = chained(2, Hash256([0xD2; 32]), Hash256([0xCC; 32]));
        pool.on_block_applied(&header, &block_with(vec![confirmed])).unwrap();

        assert!(pool.contains(&survivor));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn unwound_txs_are_reported_not_readmitted() {
        let (backend, key) = funding();
        let bus = EventBus::new(64);
        let pool = MempoolCoordinator::open(backend, bus.clone())
            .unwrap()
            .with_clock(|| 0);
        let mut rx = bus.subscribe();

        let unwound_tx = spend(key, 9 * COIN);
        let expected_txid = unwound_tx.txid();
        let header = chained(2, Hash256([0xD2; 32]), Hash256([0xCC; 32]));
        pool.on_block_unwound(&header, &block_with(vec![unwound_tx])).unwrap();

        // Pool did not readmit on its own.
        assert!(pool.is_empty());
        assert_eq!(pool.chain_tip(), Some((1, Hash256([0xCC; 32]))));

        loop {
            match rx.recv().await.unwrap() {
                CoreEvent::TxesUnconfirmed { block, unconfirmed } => {
                    assert_eq!(block, header.hash);
                    assert_eq!(unconfirmed, vec![expected_txid]);
                    break;
                }
                _ => continue,
            }
        }
    }
}
