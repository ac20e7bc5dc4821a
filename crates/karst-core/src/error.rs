//! Error types for the Karst consensus core.
use thiserror::Error;

use crate::types::{Hash256, TxOutputKey};

/// The consensus rule a block broke.
///
/// These are semantic categories: every variant means the block is invalid
/// forever and belongs in the invalid-block cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationKind {
    #[error("merkle root mismatch: computed {computed}, header {declared}")]
    MerkleRootMismatch { computed: Hash256, declared: Hash256 },
    #[error("structural rule violated in tx {tx_index}: {rule}")]
    StructuralRule { tx_index: u32, rule: String },
    #[error("value accounting overflow in tx {tx_index}")]
    AccountingOverflow { tx_index: u32 },
    #[error("sig-op count {count} exceeds limit {limit}")]
    SigOpLimit { count: u32, limit: u32 },
    #[error("block size {size} exceeds limit {limit}")]
    SizeLimit { size: usize, limit: usize },
    #[error("script verification failed on tx {tx_index} input {input_index}")]
    ScriptInvalid { tx_index: u32, input_index: u32 },
    #[error("output {0} spent twice within the block")]
    DoubleSpendWithinBlock(TxOutputKey),
    #[error("tx {tx_index} spends coinbase output with {confirmations} of {required} confirmations")]
    CoinbaseImmaturity { tx_index: u32, confirmations: u32, required: u32 },
    #[error("missing prev output {0}")]
    MissingPrevOutput(TxOutputKey),
    #[error("coinbase claims {claimed}, allowed {allowed}")]
    BadSubsidy { claimed: u64, allowed: u64 },
    #[error("difficulty bits {got:#010x} do not match schedule {expected:#010x}")]
    BadDifficulty { got: u32, expected: u32 },
    #[error("header hash does not satisfy its difficulty target")]
    BadProofOfWork,
}

/// A consensus rule violation, tagged with the offending block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("block {block} invalid: {kind}")]
pub struct ValidationError {
    pub block: Hash256,
    pub kind: ValidationKind,
}

impl ValidationError {
    pub fn new(block: Hash256, kind: ValidationKind) -> Self {
        Self { block, kind }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainIndexError {
    #[error("unknown parent {0}")] UnknownParent(Hash256),
    #[error("cumulative work mismatch for header {0}")] InvalidWork(Hash256),
    #[error("header {0} not indexed")] UnknownHeader(Hash256),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Cross-store invariant violated. Fatal; the node must stop.
    #[error("storage corrupt: {0}")] Corrupt(String),
    #[error("backend: {0}")] Backend(String),
    #[error("cursor is read-only")] ReadOnly,
    #[error("cursor already committed")] AlreadyCommitted,
    #[error("serialization: {0}")] Serialization(String),
}

/// Why a transaction was refused admission to the mempool.
///
/// A returned verdict, never an exception-like failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolReject {
    #[error("transaction already in pool: {0}")] Duplicate(Hash256),
    #[error("input {0} does not resolve to an unspent output")] UnknownOrSpentInput(TxOutputKey),
    #[error("input {0} appears twice within the transaction")] RepeatedInput(TxOutputKey),
    #[error("inputs {total_in} below outputs {total_out}")]
    InsufficientInputValue { total_in: u64, total_out: u64 },
    #[error("coinbase transactions are never admitted")] Coinbase,
    #[error("value overflow")] ValueOverflow,
}

/// Expected data not yet available; the owning worker re-attempts later.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MissingData {
    #[error("block body {0} not available")] BlockBody(Hash256),
    #[error("header {0} not available")] Header(Hash256),
}

#[derive(Error, Debug)]
pub enum KarstError {
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error(transparent)] ChainIndex(#[from] ChainIndexError),
    #[error(transparent)] Storage(#[from] StorageError),
    #[error(transparent)] Missing(#[from] MissingData),
    #[error(transparent)] Mempool(#[from] MempoolReject),
    #[error("cancelled")] Cancelled,
}

impl KarstError {
    /// Whether this error means the node cannot safely continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KarstError::Storage(StorageError::Corrupt(_)))
    }
}
