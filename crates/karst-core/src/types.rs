//! Core protocol types: transactions, blocks, chained headers, UTXO rows.
//!
//! All monetary values are in satoshis (1 coin = 10^8 satoshis). Transaction
//! and block identity is the double SHA-256 of the canonical encoding
//! ([`codec`](crate::codec)).

use std::fmt;

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec;

/// A 32-byte hash value. Used for transaction IDs, block hashes, and
/// merkle roots (all double SHA-256).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for the coinbase sentinel and
    /// the genesis previous-hash.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

/// Double SHA-256 of arbitrary bytes.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Primary key into the UTXO set: a specific output of a prior transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutputKey {
    pub tx_hash: Hash256,
    pub index: u32,
}

impl TxOutputKey {
    pub fn new(tx_hash: Hash256, index: u32) -> Self {
        Self { tx_hash, index }
    }

    /// The coinbase sentinel: zero hash, index `0xFFFFFFFF`.
    pub const fn coinbase() -> Self {
        Self { tx_hash: Hash256::ZERO, index: u32::MAX }
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_hash.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for TxOutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The output being spent. Coinbase sentinel for coinbase inputs.
    pub prev_output: TxOutputKey,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// A transaction output, creating a new spendable coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A transaction transferring value between outputs.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Compute the transaction ID: double SHA-256 of the canonical encoding.
    pub fn txid(&self) -> Hash256 {
        double_sha256(&codec::encode_tx(self))
    }

    /// Whether this is a coinbase transaction: a single input referencing
    /// the coinbase sentinel.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_output.is_coinbase()
    }

    /// Sum of all output values. `None` on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Canonical encoded size in bytes.
    pub fn encoded_size(&self) -> usize {
        codec::tx_size(self)
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Compute the block hash: double SHA-256 over the canonical 80-byte
    /// encoding (all integers little-endian).
    pub fn hash(&self) -> Hash256 {
        double_sha256(&codec::encode_header(self))
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// Ordered transactions. The first must be the coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Transaction IDs in block order.
    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }

    /// Canonical encoded size: header, var-int tx count, transactions.
    pub fn encoded_size(&self) -> usize {
        codec::block_size(self)
    }
}

/// A header linked into the chain index: position and cumulative work.
///
/// `height(genesis) = 0`; `total_work` is strictly increasing along any
/// chain (per-header work is never zero).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainedHeader {
    pub header: BlockHeader,
    /// Cached header hash.
    pub hash: Hash256,
    pub height: u32,
    /// Cumulative proof-of-work from genesis through this header.
    pub total_work: U256,
}

impl ChainedHeader {
    /// Chain a genesis header: height 0, work from its own bits.
    pub fn genesis(header: BlockHeader) -> Self {
        let hash = header.hash();
        let total_work = crate::work::work_from_bits(header.bits);
        Self { header, hash, height: 0, total_work }
    }

    /// Chain a header onto its parent.
    pub fn from_parent(parent: &ChainedHeader, header: BlockHeader) -> Self {
        let hash = header.hash();
        let total_work = parent.total_work + crate::work::work_from_bits(header.bits);
        Self { header, hash, height: parent.height + 1, total_work }
    }
}

/// Spend state of a single transaction output.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum OutputState {
    Unspent,
    Spent,
}

/// Fixed-length bitmap over the outputs of one transaction.
///
/// Bit set = spent. Flipping a bit never touches the output payloads,
/// which live in a separate table.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct OutputStates {
    bits: Vec<u8>,
    len: u32,
}

impl OutputStates {
    /// All outputs unspent.
    pub fn new(len: u32) -> Self {
        Self { bits: vec![0u8; len.div_ceil(8) as usize], len }
    }

    /// All outputs spent. Used when reconstructing a fully-spent row
    /// during unwind.
    pub fn new_all_spent(len: u32) -> Self {
        let mut states = Self::new(len);
        for i in 0..len {
            states.set(i, OutputState::Spent);
        }
        states
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self, index: u32) -> Option<OutputState> {
        if index >= self.len {
            return None;
        }
        let byte = self.bits[(index / 8) as usize];
        if byte & (1 << (index % 8)) != 0 {
            Some(OutputState::Spent)
        } else {
            Some(OutputState::Unspent)
        }
    }

    /// Set the state of one output. Out-of-range indices are ignored by
    /// callers that have already bounds-checked via [`state`](Self::state).
    pub fn set(&mut self, index: u32, state: OutputState) {
        if index >= self.len {
            return;
        }
        let slot = &mut self.bits[(index / 8) as usize];
        match state {
            OutputState::Spent => *slot |= 1 << (index % 8),
            OutputState::Unspent => *slot &= !(1 << (index % 8)),
        }
    }

    pub fn all_spent(&self) -> bool {
        (0..self.len).all(|i| self.state(i) == Some(OutputState::Spent))
    }

    pub fn all_unspent(&self) -> bool {
        (0..self.len).all(|i| self.state(i) == Some(OutputState::Unspent))
    }
}

/// A transaction present in the UTXO set.
///
/// The row is removed only once every output is spent (or by reorg unwind).
/// `tx_index == 0` identifies the block's coinbase.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UnspentTx {
    pub block_height: u32,
    pub tx_index: u32,
    pub output_states: OutputStates,
}

impl UnspentTx {
    pub fn new(block_height: u32, tx_index: u32, output_count: u32) -> Self {
        Self { block_height, tx_index, output_states: OutputStates::new(output_count) }
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_index == 0
    }
}

/// A resolved previous output, with the provenance needed for maturity
/// checks.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct PrevOutput {
    pub output: TxOutput,
    /// Height of the block that created the output.
    pub block_height: u32,
    pub is_coinbase: bool,
}

/// Per-transaction work item fed to the block validation pipeline.
#[derive(Clone, Debug)]
pub struct ValidatableTx {
    /// Position within the block.
    pub tx_index: u32,
    pub tx: std::sync::Arc<Transaction>,
    /// Cached transaction ID.
    pub txid: Hash256,
    /// Canonical encoding, used for size accounting.
    pub tx_bytes: Vec<u8>,
    /// Resolved previous outputs, aligned with `tx.inputs`. Empty for the
    /// coinbase.
    pub prev_outputs: Vec<PrevOutput>,
}

impl ValidatableTx {
    pub fn new(tx_index: u32, tx: Transaction, prev_outputs: Vec<PrevOutput>) -> Self {
        let tx_bytes = codec::encode_tx(&tx);
        let txid = double_sha256(&tx_bytes);
        Self { tx_index, tx: std::sync::Arc::new(tx), txid, tx_bytes, prev_outputs }
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx.is_coinbase()
    }
}

/// A validated transaction admitted to the mempool.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UnconfirmedTx {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Previous outputs resolved at admission, aligned with `tx.inputs`.
    /// Cached so re-validation after a reorg does not re-query the UTXO.
    pub prev_outputs: Vec<PrevOutput>,
    pub fee: u64,
    /// Unix seconds at admission.
    pub admitted_at: u64,
}

/// Restore record for one output consumed by a block.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct SpentOutputUndo {
    pub key: TxOutputKey,
    pub output: TxOutput,
    /// Position of the owning transaction, for rebuilding its UTXO row.
    pub tx_block_height: u32,
    pub tx_index: u32,
    pub tx_output_count: u32,
}

/// Everything needed to reverse one block's effect on the UTXO set.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockUndo {
    /// Outputs consumed by the block, in spend order.
    pub spent_outputs: Vec<SpentOutputUndo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_output: TxOutputKey::new(Hash256([0x11; 32]), 0),
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { value: 50 * crate::constants::COIN, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn sample_coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_output: TxOutputKey::coinbase(),
                script_sig: vec![0x01, 0x00],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { value: 50 * crate::constants::COIN, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 1_700_000_000,
            bits: crate::constants::POW_LIMIT_BITS,
            nonce: 0,
        }
    }

    // --- Hash256 / TxOutputKey ---

    #[test]
    fn hash256_zero_is_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn hash256_display_hex() {
        let s = format!("{}", Hash256([0xAB; 32]));
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("ab"));
    }

    #[test]
    fn coinbase_sentinel_detection() {
        assert!(TxOutputKey::coinbase().is_coinbase());
        assert!(!TxOutputKey::new(Hash256([1; 32]), 0).is_coinbase());
        // Zero hash alone is not the sentinel.
        assert!(!TxOutputKey::new(Hash256::ZERO, 0).is_coinbase());
    }

    // --- Transaction ---

    #[test]
    fn coinbase_detection() {
        assert!(sample_coinbase().is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn two_sentinel_inputs_is_not_coinbase() {
        let mut tx = sample_coinbase();
        tx.inputs.push(tx.inputs[0].clone());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn txid_deterministic_and_data_sensitive() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.txid());
        let mut tx2 = sample_tx();
        tx2.lock_time = 1;
        assert_ne!(tx.txid(), tx2.txid());
    }

    #[test]
    fn total_output_value_overflow_returns_none() {
        let mut tx = sample_tx();
        tx.outputs = vec![
            TxOutput { value: u64::MAX, script_pubkey: vec![] },
            TxOutput { value: 1, script_pubkey: vec![] },
        ];
        assert_eq!(tx.total_output_value(), None);
    }

    // --- BlockHeader ---

    #[test]
    fn header_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1;
        h2.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
    }

    // --- ChainedHeader ---

    #[test]
    fn genesis_chains_at_height_zero() {
        let chained = ChainedHeader::genesis(sample_header());
        assert_eq!(chained.height, 0);
        assert!(chained.total_work > U256::zero());
    }

    #[test]
    fn child_work_strictly_increases() {
        let genesis = ChainedHeader::genesis(sample_header());
        let mut child_header = sample_header();
        child_header.prev_hash = genesis.hash;
        let child = ChainedHeader::from_parent(&genesis, child_header);
        assert_eq!(child.height, 1);
        assert!(child.total_work > genesis.total_work);
    }

    // --- OutputStates ---

    #[test]
    fn output_states_start_unspent() {
        let states = OutputStates::new(10);
        assert!(states.all_unspent());
        assert!(!states.all_spent());
        assert_eq!(states.state(9), Some(OutputState::Unspent));
        assert_eq!(states.state(10), None);
    }

    #[test]
    fn output_states_spend_and_unspend() {
        let mut states = OutputStates::new(3);
        states.set(1, OutputState::Spent);
        assert_eq!(states.state(1), Some(OutputState::Spent));
        assert_eq!(states.state(0), Some(OutputState::Unspent));
        states.set(1, OutputState::Unspent);
        assert!(states.all_unspent());
    }

    #[test]
    fn output_states_all_spent_roundtrip() {
        let states = OutputStates::new_all_spent(9);
        assert!(states.all_spent());
        let mut states = states;
        states.set(8, OutputState::Unspent);
        assert!(!states.all_spent());
    }

    #[test]
    fn unspent_tx_coinbase_by_index() {
        assert!(UnspentTx::new(5, 0, 1).is_coinbase());
        assert!(!UnspentTx::new(5, 3, 1).is_coinbase());
    }

    // --- ValidatableTx ---

    #[test]
    fn validatable_tx_caches_identity() {
        let tx = sample_tx();
        let expected = tx.txid();
        let vtx = ValidatableTx::new(1, tx, vec![]);
        assert_eq!(vtx.txid, expected);
        assert_eq!(vtx.tx_bytes.len(), vtx.tx.encoded_size());
    }

    // --- Bincode round-trips for persisted rows ---

    #[test]
    fn bincode_round_trip_unspent_tx() {
        let mut row = UnspentTx::new(42, 3, 5);
        row.output_states.set(2, OutputState::Spent);
        let encoded = bincode::encode_to_vec(&row, bincode::config::standard()).unwrap();
        let (decoded, _): (UnspentTx, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(row, decoded);
    }

    #[test]
    fn bincode_round_trip_block_undo() {
        let undo = BlockUndo {
            spent_outputs: vec![SpentOutputUndo {
                key: TxOutputKey::new(Hash256([7; 32]), 1),
                output: TxOutput { value: 1234, script_pubkey: vec![0xAC] },
                tx_block_height: 10,
                tx_index: 2,
                tx_output_count: 4,
            }],
        };
        let encoded = bincode::encode_to_vec(&undo, bincode::config::standard()).unwrap();
        let (decoded, _): (BlockUndo, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(undo, decoded);
    }
}
