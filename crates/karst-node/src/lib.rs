//! # karst-node
//! Full-core composition: persistent storage, the chain state manager
//! task, and the mempool coordinator, wired over the event bus.

pub mod config;
pub mod manager;
pub mod mempool;
pub mod provider;
pub mod storage;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use karst_chain::{ChainIndex, CoreEvent, EventBus, InvalidBlockCache, TargetChainSelector};
use karst_consensus::pipeline::PipelineConfig;
use karst_core::error::KarstError;
use karst_core::genesis;
use karst_core::script::ScriptVerifier;
use karst_core::store::StorageBackend;
use karst_core::types::{Block, BlockHeader, Hash256, Transaction};

use crate::config::NodeConfig;
use crate::manager::ChainStateManager;
use crate::mempool::MempoolCoordinator;
use crate::provider::{BlockBodyProvider, StagedBlocks};

/// Install a tracing subscriber honoring `RUST_LOG`.
///
/// For binaries and integration harnesses; safe to call once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// The assembled consensus core.
///
/// The ingest collaborator (networking, out of scope) drives it through
/// [`submit_header`](Node::submit_header), [`submit_block`](Node::submit_block),
/// and [`submit_transaction`](Node::submit_transaction); everything else
/// reacts over the event bus.
pub struct Node {
    backend: Arc<dyn StorageBackend>,
    index: Arc<ChainIndex>,
    selector: Arc<TargetChainSelector>,
    invalid: Arc<InvalidBlockCache>,
    manager: Arc<ChainStateManager>,
    mempool: Arc<MempoolCoordinator>,
    staged: Arc<StagedBlocks>,
    events: EventBus,
}

impl Node {
    /// Wire the core over a storage backend and a script verifier.
    ///
    /// Anchors all stores on genesis when the backend is fresh.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        verifier: Arc<dyn ScriptVerifier>,
        config: &NodeConfig,
    ) -> Result<Self, KarstError> {
        let events = EventBus::new(config.event_capacity);
        let index = Arc::new(ChainIndex::open(backend.header_index(), genesis::genesis_header())?);
        let invalid =
            Arc::new(InvalidBlockCache::open(backend.invalid_block_cache(), events.clone())?);
        let selector = Arc::new(TargetChainSelector::new(
            Arc::clone(&index),
            Arc::clone(&invalid),
            events.clone(),
        )?);

        let staged = Arc::new(StagedBlocks::new());
        let mempool = Arc::new(MempoolCoordinator::open(
            Arc::clone(&backend),
            events.clone(),
        )?);

        let pipeline = PipelineConfig {
            parallelism: config.effective_parallelism(),
            channel_capacity: config.channel_capacity,
            ignore_script_errors: config.ignore_script_errors,
        };
        let manager = ChainStateManager::open(
            Arc::clone(&backend),
            Arc::clone(&index),
            Arc::clone(&selector),
            Arc::clone(&invalid),
            Arc::clone(&staged) as Arc<dyn BlockBodyProvider>,
            Arc::clone(&mempool),
            verifier,
            pipeline,
            events.clone(),
        )?;

        mempool.anchor_tip(manager.tip())?;

        Ok(Self { backend, index, selector, invalid, manager, mempool, staged, events })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn index(&self) -> &Arc<ChainIndex> {
        &self.index
    }

    pub fn mempool(&self) -> &Arc<MempoolCoordinator> {
        &self.mempool
    }

    pub fn manager(&self) -> &Arc<ChainStateManager> {
        &self.manager
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn invalid_blocks(&self) -> &Arc<InvalidBlockCache> {
        &self.invalid
    }

    /// Index a header and let the selector react.
    pub fn submit_header(&self, header: BlockHeader) -> Result<(), KarstError> {
        let chained = self.index.insert(header)?;
        self.selector.on_header_indexed(&chained)?;
        Ok(())
    }

    /// Stage a block body and index its header.
    ///
    /// The chain state manager picks the body up when (and if) the block
    /// lands on the target chain.
    pub fn submit_block(&self, block: Block) -> Result<(), KarstError> {
        let header = block.header;
        self.staged.insert(block);
        self.submit_header(header)?;
        self.manager.kick();
        Ok(())
    }

    /// Offer a transaction to the mempool.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, KarstError> {
        self.mempool.try_add(tx)
    }

    /// Run the chain state manager until cancelled.
    ///
    /// Also subscribes the selector to invalid-block additions, so an
    /// externally blacklisted block triggers a target rescan without the
    /// cache holding a reference back to the selector.
    pub fn spawn(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        use tokio::sync::broadcast::error::RecvError;

        let selector = Arc::clone(&self.selector);
        let watcher_manager = Arc::clone(&self.manager);
        let watcher_cancel = cancel.clone();
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watcher_cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(CoreEvent::BlockInvalidated { hash, .. }) => {
                            if let Err(err) = selector.on_block_invalidated(&hash) {
                                tracing::warn!(%err, "target rescan after invalidation failed");
                            }
                            watcher_manager.kick();
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.run(cancel).await })
    }

    /// Drive the manager to the current target chain and return.
    ///
    /// The synchronous-turn alternative to [`spawn`](Node::spawn), used by
    /// tests and by callers that schedule their own loop.
    pub async fn sync_to_target(&self, cancel: &CancellationToken) -> Result<(), KarstError> {
        self.manager.synchronize(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_consensus::pipeline::AcceptAllScripts;
    use karst_core::merkle;
    use karst_core::subsidy::block_subsidy;
    use karst_core::types::{BlockHeader, Transaction, TxInput, TxOutput, TxOutputKey};
    use karst_core::work::check_proof_of_work;

    use crate::storage::RocksBackend;

    fn mine_child(parent_hash: Hash256, parent_time: u32, bits: u32, height: u32) -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_output: TxOutputKey::coinbase(),
                script_sig: vec![height as u8, 0x2a],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: block_subsidy(height),
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let mut header = BlockHeader {
            version: 1,
            prev_hash: parent_hash,
            merkle_root: merkle::merkle_root(&[coinbase.txid()]),
            time: parent_time + 600,
            bits,
            nonce: 0,
        };
        while !check_proof_of_work(&header) {
            header.nonce += 1;
        }
        Block { header, transactions: vec![coinbase] }
    }

    #[tokio::test]
    async fn rocks_backed_node_applies_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig { pipeline_parallelism: 1, ..NodeConfig::default() };
        let b1_hash;
        {
            let backend = Arc::new(RocksBackend::open(dir.path()).unwrap());
            let node = Node::open(backend, Arc::new(AcceptAllScripts), &config).unwrap();
            let genesis = genesis::genesis_header();
            let b1 = mine_child(genesis.hash(), genesis.time, genesis.bits, 1);
            b1_hash = b1.header.hash();

            node.submit_block(b1).unwrap();
            node.sync_to_target(&CancellationToken::new()).await.unwrap();
            assert_eq!(node.manager().tip(), (1, b1_hash));
        }

        // Reopen over the same directory: headers, tip, and UTXO survive.
        let backend = Arc::new(RocksBackend::open(dir.path()).unwrap());
        let node = Node::open(backend, Arc::new(AcceptAllScripts), &config).unwrap();
        assert_eq!(node.manager().tip(), (1, b1_hash));
        assert!(node.index().get(&b1_hash).is_some());
    }
}
