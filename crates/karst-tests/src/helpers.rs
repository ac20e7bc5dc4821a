//! Test chain construction: in-memory nodes and a trivial-difficulty
//! miner.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use karst_consensus::pipeline::AcceptAllScripts;
use karst_core::constants::POW_LIMIT_BITS;
use karst_core::error::KarstError;
use karst_core::merkle;
use karst_core::store::{ChainStateCursor as _, MemoryBackend, StorageBackend as _};
use karst_core::subsidy::block_subsidy;
use karst_core::types::{
    Block, BlockHeader, ChainedHeader, Hash256, Transaction, TxInput, TxOutput, TxOutputKey,
    UnspentTx,
};
use karst_core::work::check_proof_of_work;
use karst_node::Node;
use karst_node::config::NodeConfig;

/// A node over a fresh in-memory backend with scripts accepted as-is.
pub fn test_node() -> Node {
    let config = NodeConfig {
        pipeline_parallelism: 2,
        channel_capacity: 8,
        ..NodeConfig::default()
    };
    Node::open(Arc::new(MemoryBackend::new()), Arc::new(AcceptAllScripts), &config).unwrap()
}

/// Coinbase paying `block_subsidy(height) + fees`, tagged for a unique
/// txid per (height, tag).
pub fn make_coinbase(height: u32, fees: u64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prev_output: TxOutputKey::coinbase(),
            script_sig: vec![
                (height & 0xFF) as u8,
                ((height >> 8) & 0xFF) as u8,
                ((height >> 16) & 0xFF) as u8,
                tag,
            ],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput {
            value: block_subsidy(height) + fees,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// A single-input single-output spend.
pub fn spend_tx(prev: TxOutputKey, value_out: u64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput { prev_output: prev, script_sig: vec![0x51, tag], sequence: u32::MAX }],
        outputs: vec![TxOutput { value: value_out, script_pubkey: vec![0x51, tag] }],
        lock_time: 0,
    }
}

/// Mine a child of `parent` at the parent's difficulty.
///
/// `txs` are the non-coinbase transactions; `fees` funds the coinbase on
/// top of the subsidy.
pub fn mine_block(parent: &ChainedHeader, txs: Vec<Transaction>, fees: u64, tag: u8) -> Block {
    mine_block_bits(parent, txs, fees, tag, parent.header.bits)
}

/// Mine a child of `parent` claiming an explicit target.
pub fn mine_block_bits(
    parent: &ChainedHeader,
    txs: Vec<Transaction>,
    fees: u64,
    tag: u8,
    bits: u32,
) -> Block {
    let height = parent.height + 1;
    let mut transactions = vec![make_coinbase(height, fees, tag)];
    transactions.extend(txs);
    let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();

    let mut header = BlockHeader {
        version: 1,
        prev_hash: parent.hash,
        merkle_root: merkle::merkle_root(&txids),
        time: parent.header.time + 600,
        bits,
        nonce: 0,
    };
    while !check_proof_of_work(&header) {
        header.nonce += 1;
    }
    Block { header, transactions }
}

/// Submit a block and drive the manager to the recomputed target.
pub async fn submit_and_sync(node: &Node, block: Block) -> Result<(), KarstError> {
    node.submit_block(block)?;
    node.sync_to_target(&CancellationToken::new()).await
}

/// Mine and apply `count` empty blocks on the active tip; returns the
/// mined blocks in order.
pub async fn grow_chain(node: &Node, count: u32, tag: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tip = node.manager().active_chain().tip().clone();
        let block = mine_block(&tip, vec![], 0, tag);
        submit_and_sync(node, block.clone()).await.unwrap();
        blocks.push(block);
    }
    blocks
}

/// The committed UTXO rows, sorted for comparison.
pub fn utxo_snapshot(node: &Node) -> Vec<(Hash256, UnspentTx)> {
    let cursor = node.backend().begin_chain_state(true).unwrap();
    let mut rows = cursor.unspent_txs().unwrap();
    rows.sort_by_key(|(hash, _)| *hash);
    rows
}

/// The chained header of a block the node has already indexed.
pub fn chained(node: &Node, block: &Block) -> Arc<ChainedHeader> {
    node.index().get(&block.header.hash()).expect("block is indexed")
}

/// Default bits helper for tests that reason about work.
pub fn easy_bits() -> u32 {
    POW_LIMIT_BITS
}
