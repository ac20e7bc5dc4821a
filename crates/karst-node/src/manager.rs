//! The chain state manager: the single writer of the UTXO store.
//!
//! A long-lived task reacts to target-chain changes, plans the
//! reorganization against the active chain, unwinds with stored undo data,
//! and advances through the validation pipeline. Every apply and unwind is
//! one storage transaction; a crash mid-block leaves the UTXO at the prior
//! tip. A block that fails validation is blacklisted and the loop retries
//! against the recomputed target.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use karst_chain::{Chain, ChainIndex, CoreEvent, EventBus, InvalidBlockCache, TargetChainSelector};
use karst_consensus::block_validation::{post_validate, resolve_block};
use karst_consensus::pipeline::{BlockContext, BlockValidator, PipelineConfig};
use karst_core::error::{KarstError, StorageError};
use karst_core::genesis;
use karst_core::script::ScriptVerifier;
use karst_core::store::{ChainStateCursor, StorageBackend};
use karst_core::types::{
    Block, BlockUndo, ChainedHeader, Hash256, OutputState, OutputStates, SpentOutputUndo,
    TxOutputKey, UnspentTx,
};

use crate::mempool::MempoolCoordinator;
use crate::provider::BlockBodyProvider;

/// Outcome of attempting to apply one block.
enum ApplyOutcome {
    Applied,
    /// Body not yet available; the reorg resumes when it arrives.
    Deferred,
}

pub struct ChainStateManager {
    backend: Arc<dyn StorageBackend>,
    index: Arc<ChainIndex>,
    selector: Arc<TargetChainSelector>,
    invalid: Arc<InvalidBlockCache>,
    provider: Arc<dyn BlockBodyProvider>,
    mempool: Arc<MempoolCoordinator>,
    validator: BlockValidator,
    events: EventBus,
    /// External kick (block body arrived, startup catch-up).
    wakeup: Notify,
    /// The chain currently applied to the UTXO store.
    active: RwLock<Arc<Chain>>,
}

impl ChainStateManager {
    /// Open the manager, anchoring the chain state on genesis if fresh.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        index: Arc<ChainIndex>,
        selector: Arc<TargetChainSelector>,
        invalid: Arc<InvalidBlockCache>,
        provider: Arc<dyn BlockBodyProvider>,
        mempool: Arc<MempoolCoordinator>,
        verifier: Arc<dyn ScriptVerifier>,
        pipeline: PipelineConfig,
        events: EventBus,
    ) -> Result<Arc<Self>, KarstError> {
        let tip = {
            let cursor = backend.begin_chain_state(true)?;
            cursor.chain_tip()?
        };
        let tip = match tip {
            Some(tip) => tip,
            None => Self::anchor_genesis(backend.as_ref())?,
        };

        let active = index
            .get(&tip.1)
            .ok_or_else(|| {
                StorageError::Corrupt(format!("chain tip {} missing from header index", tip.1))
            })
            .and_then(|_| {
                index.chain_to(&tip.1).map_err(|_| {
                    StorageError::Corrupt(format!("chain tip {} does not materialize", tip.1))
                })
            })?;

        Ok(Arc::new(Self {
            backend,
            index,
            selector,
            invalid,
            provider,
            mempool,
            validator: BlockValidator::new(verifier, pipeline),
            events,
            wakeup: Notify::new(),
            active: RwLock::new(Arc::new(active)),
        }))
    }

    /// Write the genesis block's outputs and tip; no validation applies.
    fn anchor_genesis(backend: &dyn StorageBackend) -> Result<(u32, Hash256), KarstError> {
        let block = genesis::genesis_block();
        let hash = block.header.hash();
        let mut cursor = backend.begin_chain_state(false)?;
        let mut rows = 0u64;
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            cursor.try_add_unspent_tx(
                &txid,
                &UnspentTx::new(0, tx_index as u32, tx.outputs.len() as u32),
            )?;
            for (i, output) in tx.outputs.iter().enumerate() {
                cursor.try_add_unspent_output(&TxOutputKey::new(txid, i as u32), output)?;
            }
            rows += 1;
        }
        cursor.set_unspent_tx_count(rows)?;
        cursor.put_block_undo(&hash, &BlockUndo::default())?;
        cursor.set_chain_tip(Some((0, hash)))?;
        cursor.commit()?;
        tracing::info!(block = %hash, "anchored genesis");
        Ok((0, hash))
    }

    /// The chain currently applied to the UTXO store.
    pub fn active_chain(&self) -> Arc<Chain> {
        Arc::clone(&self.active.read())
    }

    pub fn tip(&self) -> (u32, Hash256) {
        let chain = self.active_chain();
        (chain.height(), chain.tip().hash)
    }

    /// Wake the run loop (a block body arrived, or a caller wants a
    /// catch-up pass).
    pub fn kick(&self) {
        self.wakeup.notify_one();
    }

    /// React to target-chain changes until cancelled. Cancellation takes
    /// effect at block boundaries, never mid-commit.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.events.subscribe();

        // Catch up with whatever happened before we started listening.
        if let Err(err) = self.synchronize(&cancel).await {
            if err.is_fatal() {
                tracing::error!(%err, "chain state manager stopping");
                return;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wakeup.notified() => {}
                event = events.recv() => {
                    use tokio::sync::broadcast::error::RecvError;
                    match event {
                        Ok(CoreEvent::TargetChainChanged { .. }) => {}
                        Ok(_) => continue,
                        // Dropped events only mean we should recompute.
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    }
                }
            }

            match self.synchronize(&cancel).await {
                Ok(()) => {}
                Err(KarstError::Cancelled) => break,
                Err(err) if err.is_fatal() => {
                    tracing::error!(%err, "chain state manager stopping");
                    break;
                }
                Err(err) => tracing::warn!(%err, "synchronization pass failed"),
            }
        }
    }

    /// Move the active chain to the selector's target, blacklisting and
    /// retrying on validation failures. Returns with the active tip at
    /// the (possibly recomputed) target, or deferred on missing bodies.
    pub async fn synchronize(&self, cancel: &CancellationToken) -> Result<(), KarstError> {
        loop {
            let target = self.selector.target_chain();
            let active = self.active_chain();
            if target.tip().hash == active.tip().hash {
                return Ok(());
            }

            let plan = active.reorg_plan(&target).ok_or_else(|| {
                StorageError::Corrupt("target chain shares no ancestor with active chain".into())
            })?;
            if !plan.rewind.is_empty() {
                tracing::info!(
                    depth = plan.rewind.len(),
                    fork_height = plan.common_ancestor.height,
                    target = %target.tip().hash,
                    "reorganizing"
                );
            }

            for header in &plan.rewind {
                if cancel.is_cancelled() {
                    return Err(KarstError::Cancelled);
                }
                // An applied block later marked invalid means the stores
                // and the blacklist disagree about history.
                if self.invalid.contains(&header.hash) {
                    return Err(StorageError::Corrupt(format!(
                        "applied block {} is blacklisted",
                        header.hash
                    ))
                    .into());
                }
                self.unwind_block(header).await?;
            }

            for header in &plan.advance {
                if cancel.is_cancelled() {
                    return Err(KarstError::Cancelled);
                }
                match self.apply_block(header, cancel).await {
                    Ok(ApplyOutcome::Applied) => {}
                    Ok(ApplyOutcome::Deferred) => return Ok(()),
                    Err(KarstError::Validation(err)) => {
                        // Blacklist and fall out to recompute the target;
                        // the selector already dropped this branch.
                        self.invalid.add(err.block, err.kind.to_string())?;
                        self.selector.on_block_invalidated(&err.block)?;
                        break;
                    }
                    Err(other) => return Err(other),
                }
            }
        }
    }

    /// Validate and apply one block on top of the active tip.
    async fn apply_block(
        &self,
        header: &Arc<ChainedHeader>,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, KarstError> {
        let Some(block) = self.provider.fetch(&header.hash).await? else {
            tracing::debug!(block = %header.hash, "block body not available, deferring");
            return Ok(ApplyOutcome::Deferred);
        };
        if block.header.hash() != header.hash {
            tracing::warn!(block = %header.hash, "provider returned mismatched body, deferring");
            return Ok(ApplyOutcome::Deferred);
        }

        // Resolve prev-outputs against the state as of the parent.
        let resolved = {
            let cursor = self.backend.begin_chain_state(true)?;
            resolve_block(&block, header.height, cursor.as_ref())?
        };

        let ctx = BlockContext {
            block_hash: header.hash,
            height: header.height,
            time: header.header.time,
            merkle_root: header.header.merkle_root,
        };
        let totals = self.validator.validate_txs(ctx, resolved, cancel.child_token()).await?;

        let parent = self.index.get(&header.header.prev_hash).ok_or_else(|| {
            StorageError::Corrupt(format!("parent of {} missing from index", header.hash))
        })?;
        let expected_bits = self.index.expected_bits(&parent)?;
        post_validate(header, expected_bits, &totals, block.coinbase())?;

        self.apply_validated(header, &block)?;

        self.events.publish(CoreEvent::BlockApplied {
            header: header.header,
            height: header.height,
        });
        self.events.publish(CoreEvent::ChainTipAdvanced {
            tip: header.hash,
            height: header.height,
        });
        self.mempool.on_block_applied(header, &block)?;

        tracing::info!(
            block = %header.hash,
            height = header.height,
            txs = totals.tx_count,
            fees = totals.total_fees,
            "block applied"
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Mutate the UTXO store for a fully validated block; one commit.
    fn apply_validated(&self, header: &Arc<ChainedHeader>, block: &Block) -> Result<(), KarstError> {
        let mut cursor = self.backend.begin_chain_state(false)?;

        let tip = cursor.chain_tip()?;
        let expected_parent = (header.height.wrapping_sub(1), header.header.prev_hash);
        if tip != Some(expected_parent) {
            return Err(StorageError::Corrupt(format!(
                "applying {} over unexpected tip {tip:?}",
                header.hash
            ))
            .into());
        }

        let mut undo = BlockUndo::default();
        let mut rows_added = 0u64;
        let mut rows_removed = 0u64;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();

            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let key = input.prev_output;
                    let corrupt =
                        |what: &str| StorageError::Corrupt(format!("{what} for {key}"));

                    let row = cursor
                        .try_get_unspent_tx(&key.tx_hash)?
                        .ok_or_else(|| corrupt("validated spend has no UTXO row"))?;
                    let output = cursor
                        .try_get_unspent_output(&key)?
                        .ok_or_else(|| corrupt("validated spend has no output row"))?;
                    let previous = cursor
                        .try_spend_output(&key)?
                        .ok_or_else(|| corrupt("spend flip failed"))?;
                    if previous == OutputState::Spent {
                        return Err(corrupt("validated spend was already spent").into());
                    }
                    cursor.try_remove_unspent_output(&key)?;

                    undo.spent_outputs.push(SpentOutputUndo {
                        key,
                        output,
                        tx_block_height: row.block_height,
                        tx_index: row.tx_index,
                        tx_output_count: row.output_states.len(),
                    });

                    if let Some(now) = cursor.try_get_unspent_tx(&key.tx_hash)? {
                        if now.output_states.all_spent() {
                            cursor.try_remove_unspent_tx(&key.tx_hash)?;
                            rows_removed += 1;
                        }
                    }
                }
            }

            let row = UnspentTx::new(header.height, tx_index as u32, tx.outputs.len() as u32);
            if !cursor.try_add_unspent_tx(&txid, &row)? {
                // A live predecessor with the same hash; refuse to
                // overwrite spendable history.
                return Err(karst_core::error::ValidationError::new(
                    header.hash,
                    karst_core::error::ValidationKind::StructuralRule {
                        tx_index: tx_index as u32,
                        rule: "transaction hash collides with an unspent predecessor".into(),
                    },
                )
                .into());
            }
            rows_added += 1;
            for (i, output) in tx.outputs.iter().enumerate() {
                cursor.try_add_unspent_output(&TxOutputKey::new(txid, i as u32), output)?;
            }
        }

        let count = cursor
            .unspent_tx_count()?
            .saturating_add(rows_added)
            .saturating_sub(rows_removed);
        cursor.set_unspent_tx_count(count)?;
        cursor.put_block_undo(&header.hash, &undo)?;
        cursor.set_chain_tip(Some((header.height, header.hash)))?;
        cursor.commit()?;

        self.set_active(&header.hash)?;
        Ok(())
    }

    /// Reverse-apply the active tip block using its undo data; one commit.
    async fn unwind_block(&self, header: &Arc<ChainedHeader>) -> Result<(), KarstError> {
        let block = self
            .provider
            .fetch(&header.hash)
            .await?
            .ok_or_else(|| {
                StorageError::Corrupt(format!("applied block {} has no stored body", header.hash))
            })?;

        let mut cursor = self.backend.begin_chain_state(false)?;
        let tip = cursor.chain_tip()?;
        if tip != Some((header.height, header.hash)) {
            return Err(StorageError::Corrupt(format!(
                "unwinding {} which is not the tip {tip:?}",
                header.hash
            ))
            .into());
        }
        if header.height == 0 {
            return Err(StorageError::Corrupt("attempted to unwind genesis".into()).into());
        }
        let undo = cursor.block_undo(&header.hash)?.ok_or_else(|| {
            StorageError::Corrupt(format!("undo data missing for {}", header.hash))
        })?;

        let mut rows_removed = 0u64;
        let mut rows_restored = 0u64;

        // Delete what the block created, newest transactions first.
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            if cursor.try_remove_unspent_tx(&txid)? {
                rows_removed += 1;
            }
            for i in 0..tx.outputs.len() {
                cursor.try_remove_unspent_output(&TxOutputKey::new(txid, i as u32))?;
            }
        }

        // Re-credit what the block consumed, reverse spend order.
        for entry in undo.spent_outputs.iter().rev() {
            match cursor.try_get_unspent_tx(&entry.key.tx_hash)? {
                Some(_) => {
                    cursor.try_unspend_output(&entry.key)?;
                }
                None => {
                    let mut row = UnspentTx {
                        block_height: entry.tx_block_height,
                        tx_index: entry.tx_index,
                        output_states: OutputStates::new_all_spent(entry.tx_output_count),
                    };
                    row.output_states.set(entry.key.index, OutputState::Unspent);
                    cursor.try_add_unspent_tx(&entry.key.tx_hash, &row)?;
                    rows_restored += 1;
                }
            }
            cursor.try_add_unspent_output(&entry.key, &entry.output)?;
        }

        let count = cursor
            .unspent_tx_count()?
            .saturating_sub(rows_removed)
            .saturating_add(rows_restored);
        cursor.set_unspent_tx_count(count)?;
        cursor.remove_block_undo(&header.hash)?;
        cursor.set_chain_tip(Some((header.height - 1, header.header.prev_hash)))?;
        cursor.commit()?;

        self.set_active(&header.header.prev_hash)?;

        self.events.publish(CoreEvent::BlockUnwound {
            header: header.header,
            height: header.height,
        });
        self.mempool.on_block_unwound(header, &block)?;

        tracing::info!(block = %header.hash, height = header.height, "block unwound");
        Ok(())
    }

    fn set_active(&self, tip: &Hash256) -> Result<(), KarstError> {
        let chain = Arc::new(self.index.chain_to(tip)?);
        *self.active.write() = chain;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use karst_consensus::pipeline::AcceptAllScripts;
    use karst_core::store::{ChainStateCursor as _, MemoryBackend, StorageBackend as _};

    use crate::Node;
    use crate::config::NodeConfig;

    use super::*;

    fn open_node(backend: Arc<MemoryBackend>) -> Node {
        let config = NodeConfig { pipeline_parallelism: 1, ..NodeConfig::default() };
        Node::open(backend, Arc::new(AcceptAllScripts), &config).unwrap()
    }

    #[test]
    fn open_anchors_genesis_on_fresh_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let node = open_node(Arc::clone(&backend));

        let (height, hash) = node.manager().tip();
        assert_eq!(height, 0);
        assert_eq!(hash, genesis::genesis_hash());

        let cursor = backend.begin_chain_state(true).unwrap();
        assert_eq!(cursor.chain_tip().unwrap(), Some((0, hash)));
        assert_eq!(cursor.unspent_tx_count().unwrap(), 1);
        let coinbase_txid = genesis::genesis_block().transactions[0].txid();
        assert!(cursor.try_get_unspent_tx(&coinbase_txid).unwrap().is_some());
    }

    #[test]
    fn reopening_does_not_reanchor() {
        let backend = Arc::new(MemoryBackend::new());
        drop(open_node(Arc::clone(&backend)));
        let node = open_node(Arc::clone(&backend));

        assert_eq!(node.manager().tip().0, 0);
        let cursor = backend.begin_chain_state(true).unwrap();
        assert_eq!(cursor.unspent_tx_count().unwrap(), 1);
        assert_eq!(cursor.unspent_txs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn synchronize_with_no_new_target_is_a_no_op() {
        let backend = Arc::new(MemoryBackend::new());
        let node = open_node(backend);
        let before = node.manager().tip();
        node.sync_to_target(&CancellationToken::new()).await.unwrap();
        assert_eq!(node.manager().tip(), before);
    }
}
