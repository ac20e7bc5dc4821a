//! Per-transaction consensus rules.
//!
//! Two levels, mirroring the pipeline stages that apply them:
//!
//! - **Structural** ([`validate_tx_structure`]): context-free checks on one
//!   transaction in its block slot.
//! - **Contextual** ([`validate_tx_context`]): rules that need the resolved
//!   previous outputs and the containing block's height and time.
//!
//! Both return the broken [`ValidationKind`]; the caller attaches the block
//! hash. Double-spend detection across a block lives in the pipeline, which
//! owns the shared spent-set.

use crate::constants::{
    COINBASE_MATURITY, COINBASE_SCRIPT_SIG_MAX, COINBASE_SCRIPT_SIG_MIN, LOCKTIME_THRESHOLD,
    MAX_MONEY, SEQUENCE_FINAL,
};
use crate::error::ValidationKind;
use crate::types::{Transaction, ValidatableTx};

/// Value totals of a contextually valid transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxTotals {
    pub total_in: u64,
    pub total_out: u64,
    pub fee: u64,
}

fn structural(tx_index: u32, rule: impl Into<String>) -> ValidationKind {
    ValidationKind::StructuralRule { tx_index, rule: rule.into() }
}

/// Context-free checks for the transaction at `tx_index` of a block.
pub fn validate_tx_structure(tx_index: u32, tx: &Transaction) -> Result<(), ValidationKind> {
    if tx.inputs.is_empty() {
        return Err(structural(tx_index, "no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(structural(tx_index, "no outputs"));
    }

    let mut total_out: u64 = 0;
    for output in &tx.outputs {
        if output.value > MAX_MONEY {
            return Err(structural(tx_index, "output value above maximum money"));
        }
        total_out = total_out
            .checked_add(output.value)
            .ok_or(ValidationKind::AccountingOverflow { tx_index })?;
    }
    if total_out > MAX_MONEY {
        return Err(structural(tx_index, "output sum above maximum money"));
    }

    if tx_index == 0 {
        if !tx.is_coinbase() {
            return Err(structural(tx_index, "first transaction is not a coinbase"));
        }
        let len = tx.inputs[0].script_sig.len();
        if !(COINBASE_SCRIPT_SIG_MIN..=COINBASE_SCRIPT_SIG_MAX).contains(&len) {
            return Err(structural(tx_index, "coinbase script_sig length out of range"));
        }
    } else {
        if tx.is_coinbase() {
            return Err(structural(tx_index, "coinbase outside block slot 0"));
        }
        // A multi-input tx smuggling a sentinel input is not a coinbase but
        // still forbidden.
        if tx.inputs.iter().any(|i| i.prev_output.is_coinbase()) {
            return Err(structural(tx_index, "coinbase sentinel input in non-coinbase tx"));
        }
    }

    Ok(())
}

/// Whether a transaction is final with respect to its containing block.
///
/// `lock_time == 0` is always final; otherwise the lock is a height or a
/// Unix time depending on [`LOCKTIME_THRESHOLD`]. Inputs carrying the
/// final sequence value disable the check.
pub fn is_final(tx: &Transaction, block_height: u32, block_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD { block_height } else { block_time };
    if tx.lock_time < cutoff {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// Contextual checks for a resolved non-coinbase transaction.
///
/// `vtx.prev_outputs` must align with the inputs (the resolver guarantees
/// this). Returns the value totals for block-level fee accounting.
pub fn validate_tx_context(
    vtx: &ValidatableTx,
    block_height: u32,
    block_time: u32,
) -> Result<TxTotals, ValidationKind> {
    let tx_index = vtx.tx_index;
    debug_assert_eq!(vtx.prev_outputs.len(), vtx.tx.inputs.len());

    for prev in &vtx.prev_outputs {
        if prev.is_coinbase {
            let confirmations = block_height.saturating_sub(prev.block_height);
            if confirmations < COINBASE_MATURITY {
                return Err(ValidationKind::CoinbaseImmaturity {
                    tx_index,
                    confirmations,
                    required: COINBASE_MATURITY,
                });
            }
        }
    }

    if !is_final(&vtx.tx, block_height, block_time) {
        return Err(structural(tx_index, "lock_time not final for this block"));
    }

    let mut total_in: u64 = 0;
    for prev in &vtx.prev_outputs {
        total_in = total_in
            .checked_add(prev.output.value)
            .ok_or(ValidationKind::AccountingOverflow { tx_index })?;
    }
    let total_out = vtx
        .tx
        .total_output_value()
        .ok_or(ValidationKind::AccountingOverflow { tx_index })?;

    if total_in < total_out {
        return Err(structural(tx_index, "output value exceeds input value"));
    }
    let fee = total_in - total_out;
    if fee > MAX_MONEY {
        return Err(ValidationKind::AccountingOverflow { tx_index });
    }

    Ok(TxTotals { total_in, total_out, fee })
}
