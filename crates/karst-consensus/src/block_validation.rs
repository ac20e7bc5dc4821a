//! Whole-block contextual validation and prev-output resolution.
//!
//! [`resolve_block`] turns a raw block into the pipeline's ValidatableTx
//! stream by resolving every input against the UTXO view — or against an
//! earlier transaction in the same block, since in-block spend chains are
//! legal. [`post_validate`] runs after the pipeline drains: subsidy,
//! height commitment, difficulty schedule, and proof-of-work.

use std::collections::HashMap;

use karst_core::error::{
    KarstError, StorageError, ValidationError, ValidationKind,
};
use karst_core::store::ChainStateCursor;
use karst_core::subsidy;
use karst_core::types::{
    Block, ChainedHeader, Hash256, OutputState, PrevOutput, Transaction, ValidatableTx,
};
use karst_core::work;

use crate::pipeline::BlockTotals;

/// Resolve a block's transactions into pipeline work items.
///
/// Inputs resolve from the chain state as of the parent block, or from
/// outputs created earlier in this block. An input that resolves to
/// nothing unspent is a consensus failure
/// ([`ValidationKind::MissingPrevOutput`]); a UTXO row whose output bytes
/// are missing from the side table is storage corruption.
pub fn resolve_block(
    block: &Block,
    height: u32,
    cursor: &dyn ChainStateCursor,
) -> Result<Vec<ValidatableTx>, KarstError> {
    let block_hash = block.header.hash();
    let mut resolved = Vec::with_capacity(block.transactions.len());
    let mut in_block: HashMap<Hash256, (u32, &Transaction)> = HashMap::new();

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let tx_index = tx_index as u32;
        let mut prev_outputs = Vec::new();

        if !tx.is_coinbase() {
            prev_outputs.reserve(tx.inputs.len());
            for input in &tx.inputs {
                let key = input.prev_output;
                let missing = || {
                    ValidationError::new(block_hash, ValidationKind::MissingPrevOutput(key))
                };

                if let Some(&(src_index, src_tx)) = in_block.get(&key.tx_hash) {
                    let output = src_tx
                        .outputs
                        .get(key.index as usize)
                        .ok_or_else(missing)?;
                    prev_outputs.push(PrevOutput {
                        output: output.clone(),
                        block_height: height,
                        is_coinbase: src_index == 0,
                    });
                    continue;
                }

                let Some(row) = cursor.try_get_unspent_tx(&key.tx_hash)? else {
                    return Err(missing().into());
                };
                if row.output_states.state(key.index) != Some(OutputState::Unspent) {
                    return Err(missing().into());
                }
                let Some(output) = cursor.try_get_unspent_output(&key)? else {
                    // The state bitmap says Unspent but the payload row is
                    // gone: the stores disagree.
                    return Err(StorageError::Corrupt(format!(
                        "unspent output {key} has no payload row"
                    ))
                    .into());
                };
                prev_outputs.push(PrevOutput {
                    output,
                    block_height: row.block_height,
                    is_coinbase: row.is_coinbase(),
                });
            }
        }

        in_block.insert(tx.txid(), (tx_index, tx));
        resolved.push(ValidatableTx::new(tx_index, tx.clone(), prev_outputs));
    }

    Ok(resolved)
}

/// The minimal-number push BIP34 requires as the coinbase script prefix.
pub fn bip34_height_push(height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut value = height;
    while value > 0 {
        bytes.push((value & 0xFF) as u8);
        value >>= 8;
    }
    // Keep the sign bit clear, as script numbers are signed.
    if let Some(&last) = bytes.last() {
        if last & 0x80 != 0 {
            bytes.push(0);
        }
    }
    let mut push = Vec::with_capacity(bytes.len() + 1);
    push.push(bytes.len() as u8);
    push.extend_from_slice(&bytes);
    push
}

/// Contextual whole-block checks, run after the pipeline drains.
///
/// `expected_bits` is the schedule's pinned target at a retarget boundary,
/// `None` elsewhere (mid-window blocks may claim any target; their own
/// proof-of-work still has to meet it).
pub fn post_validate(
    chained: &ChainedHeader,
    expected_bits: Option<u32>,
    totals: &BlockTotals,
    coinbase: Option<&Transaction>,
) -> Result<(), ValidationError> {
    let block = chained.hash;
    let fail = |kind| Err(ValidationError::new(block, kind));

    if totals.tx_count == 0 {
        return fail(ValidationKind::StructuralRule {
            tx_index: 0,
            rule: "block has no transactions".into(),
        });
    }
    let Some(coinbase) = coinbase else {
        return fail(ValidationKind::StructuralRule {
            tx_index: 0,
            rule: "block has no coinbase".into(),
        });
    };

    if !work::check_proof_of_work(&chained.header) {
        return fail(ValidationKind::BadProofOfWork);
    }

    if let Some(expected) = expected_bits {
        if chained.header.bits != expected {
            return fail(ValidationKind::BadDifficulty {
                got: chained.header.bits,
                expected,
            });
        }
    }

    // BIP34: version 2 blocks commit their height as the first coinbase
    // script push.
    if chained.header.version >= 2 {
        let push = bip34_height_push(chained.height);
        if !coinbase.inputs[0].script_sig.starts_with(&push) {
            return fail(ValidationKind::StructuralRule {
                tx_index: 0,
                rule: "coinbase does not commit the block height".into(),
            });
        }
    }

    let allowed = subsidy::block_subsidy(chained.height)
        .checked_add(totals.total_fees)
        .ok_or_else(|| {
            ValidationError::new(block, ValidationKind::AccountingOverflow { tx_index: 0 })
        })?;
    if totals.coinbase_value > allowed {
        return fail(ValidationKind::BadSubsidy {
            claimed: totals.coinbase_value,
            allowed,
        });
    }

    Ok(())
}
