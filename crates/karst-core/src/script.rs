//! Script byte-walking for sig-op accounting, and the verification seam.
//!
//! Full script execution is an external collaborator behind
//! [`ScriptVerifier`]; the core only needs the externally observable
//! verdict per input. Sig-op counting, however, is consensus-critical for
//! the per-block budget and is performed here by walking script bytes the
//! way the reference node does: truncated pushes end the walk without
//! error, counting whatever was seen.

use thiserror::Error;

use crate::constants::MAX_PUBKEYS_PER_MULTISIG;
use crate::types::{PrevOutput, Transaction};

// Opcodes the walker and the P2SH template need.
pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Marker for "no previous opcode" in the walker.
const OP_INVALID: u8 = 0xff;

/// A failed script verification verdict.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("script rejected: {0}")]
pub struct ScriptError(pub String);

/// Flags passed through to the external verifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifyFlags {
    /// Enforce BIP16 pay-to-script-hash evaluation.
    pub p2sh: bool,
}

/// External script interpreter. Pure: the verdict depends only on the
/// arguments.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
        script_sig: &[u8],
        flags: VerifyFlags,
    ) -> Result<(), ScriptError>;
}

/// Decode OP_1..OP_16 to its small integer.
fn decode_op_n(opcode: u8) -> u32 {
    debug_assert!((OP_1..=OP_16).contains(&opcode));
    (opcode - OP_1 + 1) as u32
}

/// Count signature operations in a script.
///
/// `accurate` applies the post-BIP16 multisig rule: an OP_CHECKMULTISIG
/// immediately preceded by OP_N counts N, otherwise
/// [`MAX_PUBKEYS_PER_MULTISIG`]. Legacy (block-level) counting always uses
/// the maximum.
pub fn sig_op_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = OP_INVALID;
    let mut i = 0usize;

    while i < script.len() {
        let opcode = script[i];
        i += 1;

        if opcode <= OP_PUSHDATA4 {
            // Push operation: skip the pushed data. A length field or
            // payload running past the end terminates the walk.
            let push_len = match opcode {
                OP_PUSHDATA1 => {
                    let Some(&len) = script.get(i) else { break };
                    i += 1;
                    len as usize
                }
                OP_PUSHDATA2 => {
                    let Some(bytes) = script.get(i..i + 2) else { break };
                    i += 2;
                    u16::from_le_bytes([bytes[0], bytes[1]]) as usize
                }
                OP_PUSHDATA4 => {
                    let Some(bytes) = script.get(i..i + 4) else { break };
                    i += 4;
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                direct => direct as usize,
            };
            if push_len > script.len() - i {
                break;
            }
            i += push_len;
        } else {
            match opcode {
                OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                        count += decode_op_n(last_opcode);
                    } else {
                        count += MAX_PUBKEYS_PER_MULTISIG;
                    }
                }
                _ => {}
            }
        }
        last_opcode = opcode;
    }
    count
}

/// Whether a script_pubkey matches the P2SH template:
/// `OP_HASH160 <20 bytes> OP_EQUAL`.
pub fn is_pay_to_script_hash(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

/// Extract the data pushes of a push-only script, in order.
///
/// Returns `None` if the script contains any non-push opcode (such a
/// script_sig fails evaluation, so its redeem script never runs).
fn push_data(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut pushes = Vec::new();
    let mut i = 0usize;
    while i < script.len() {
        let opcode = script[i];
        i += 1;
        if opcode > OP_16 {
            return None;
        }
        if opcode == OP_0 || opcode == OP_1NEGATE || (OP_1..=OP_16).contains(&opcode) {
            pushes.push(Vec::new());
            continue;
        }
        let push_len = match opcode {
            OP_PUSHDATA1 => {
                let len = *script.get(i)? as usize;
                i += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(i..i + 2)?;
                i += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(i..i + 4)?;
                i += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            direct => direct as usize,
        };
        let data = script.get(i..i + push_len)?;
        pushes.push(data.to_vec());
        i += push_len;
    }
    Some(pushes)
}

/// Accurate sig-ops contributed by a P2SH spend.
///
/// The redeem script is the last push of the script_sig; a non-P2SH
/// script_pubkey or a non-push-only script_sig contributes zero.
pub fn p2sh_sig_op_count(script_sig: &[u8], script_pubkey: &[u8]) -> u32 {
    if !is_pay_to_script_hash(script_pubkey) {
        return 0;
    }
    match push_data(script_sig).and_then(|pushes| pushes.into_iter().next_back()) {
        Some(redeem_script) => sig_op_count(&redeem_script, true),
        None => 0,
    }
}

/// Legacy sig-ops of a whole transaction: every script_sig and every
/// script_pubkey, counted inaccurately.
pub fn legacy_tx_sig_ops(tx: &Transaction) -> u32 {
    let inputs: u32 = tx.inputs.iter().map(|i| sig_op_count(&i.script_sig, false)).sum();
    let outputs: u32 = tx.outputs.iter().map(|o| sig_op_count(&o.script_pubkey, false)).sum();
    inputs + outputs
}

/// P2SH sig-ops of a transaction against its resolved previous outputs.
///
/// `prev_outputs` must align with `tx.inputs`. Coinbase transactions have
/// no previous outputs and contribute zero.
pub fn p2sh_tx_sig_ops(tx: &Transaction, prev_outputs: &[PrevOutput]) -> u32 {
    if tx.is_coinbase() {
        return 0;
    }
    tx.inputs
        .iter()
        .zip(prev_outputs)
        .map(|(input, prev)| p2sh_sig_op_count(&input.script_sig, &prev.output.script_pubkey))
        .sum()
}
