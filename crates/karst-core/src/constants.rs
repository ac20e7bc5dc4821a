//! Consensus constants. All monetary values in satoshis (1 coin = 10^8 satoshis).

pub const COIN: u64 = 100_000_000;

/// Hard cap on total monetary value (21 million coins).
///
/// No single output, output sum, or fee may exceed this.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

pub const INITIAL_SUBSIDY: u64 = 50 * COIN;
pub const HALVING_INTERVAL: u32 = 210_000;

/// Maximum serialized block size in bytes, including the var-int tx count.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum accumulated signature operations per block.
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;

/// Maximum keys counted for an OP_CHECKMULTISIG without an explicit OP_N count.
pub const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// Confirmations required before a coinbase output may be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// Unix time at which P2SH sig-op counting activates (BIP16).
pub const BIP16_SWITCH_TIME: u32 = 1_333_238_400;

/// Lock-time values below this are block heights; at or above, Unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence value that exempts an input from lock-time enforcement.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

pub const COINBASE_SCRIPT_SIG_MIN: usize = 2;
pub const COINBASE_SCRIPT_SIG_MAX: usize = 100;

/// Difficulty retarget interval in blocks.
pub const RETARGET_INTERVAL: u32 = 2_016;

/// Expected seconds per retarget window (two weeks).
pub const TARGET_TIMESPAN: u32 = 1_209_600;

/// Expected seconds between blocks.
pub const TARGET_SPACING: u32 = 600;

/// Easiest allowed difficulty, in compact encoding. Used by the genesis block.
pub const POW_LIMIT_BITS: u32 = 0x207f_ffff;
