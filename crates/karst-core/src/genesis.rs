//! The genesis block.
//!
//! Built deterministically at first use; every store anchors on it and the
//! chain index refuses headers that cannot reach it.

use crate::constants::{COIN, POW_LIMIT_BITS};
use crate::merkle;
use crate::types::{
    Block, BlockHeader, Hash256, Transaction, TxInput, TxOutput, TxOutputKey,
};

/// Timestamp baked into the genesis header.
pub const GENESIS_TIME: u32 = 1_296_688_602;

const GENESIS_MESSAGE: &[u8] = b"karst 2011-02-02 cold water over old stone";

fn genesis_coinbase() -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prev_output: TxOutputKey::coinbase(),
            script_sig: GENESIS_MESSAGE.to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput {
            value: 50 * COIN,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// The full genesis block.
pub fn genesis_block() -> Block {
    let coinbase = genesis_coinbase();
    let merkle_root = merkle::merkle_root(&[coinbase.txid()]);
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root,
            time: GENESIS_TIME,
            bits: POW_LIMIT_BITS,
            nonce: 0,
        },
        transactions: vec![coinbase],
    }
}

pub fn genesis_header() -> BlockHeader {
    genesis_block().header
}

pub fn genesis_hash() -> Hash256 {
    genesis_header().hash()
}

/// Whether a header is the genesis header.
pub fn is_genesis(header: &BlockHeader) -> bool {
    header.prev_hash.is_zero() && header.hash() == genesis_hash()
}
