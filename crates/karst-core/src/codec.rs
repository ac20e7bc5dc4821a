//! Canonical wire encoding: var-int lengths, little-endian integers,
//! fixed-width hashes.
//!
//! Only the encode direction is needed by the core — identity hashing and
//! size accounting. Decoding full blocks off the wire belongs to the
//! networking collaborator.

use crate::types::{Block, BlockHeader, Transaction, TxInput, TxOutput};

/// Serialized length of a var-int for `value`.
pub fn var_int_size(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Append a var-int (Bitcoin compact-size) encoding of `value`.
pub fn write_var_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn write_input(out: &mut Vec<u8>, input: &TxInput) {
    out.extend_from_slice(input.prev_output.tx_hash.as_bytes());
    out.extend_from_slice(&input.prev_output.index.to_le_bytes());
    write_var_int(out, input.script_sig.len() as u64);
    out.extend_from_slice(&input.script_sig);
    out.extend_from_slice(&input.sequence.to_le_bytes());
}

fn write_output(out: &mut Vec<u8>, output: &TxOutput) {
    out.extend_from_slice(&output.value.to_le_bytes());
    write_var_int(out, output.script_pubkey.len() as u64);
    out.extend_from_slice(&output.script_pubkey);
}

/// Canonical transaction encoding.
pub fn encode_tx(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(tx_size(tx));
    out.extend_from_slice(&tx.version.to_le_bytes());
    write_var_int(&mut out, tx.inputs.len() as u64);
    for input in &tx.inputs {
        write_input(&mut out, input);
    }
    write_var_int(&mut out, tx.outputs.len() as u64);
    for output in &tx.outputs {
        write_output(&mut out, output);
    }
    out.extend_from_slice(&tx.lock_time.to_le_bytes());
    out
}

/// Canonical transaction size without materializing the encoding.
pub fn tx_size(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .inputs
        .iter()
        .map(|i| 32 + 4 + var_int_size(i.script_sig.len() as u64) + i.script_sig.len() + 4)
        .sum();
    let outputs: usize = tx
        .outputs
        .iter()
        .map(|o| 8 + var_int_size(o.script_pubkey.len() as u64) + o.script_pubkey.len())
        .sum();
    4 + var_int_size(tx.inputs.len() as u64)
        + inputs
        + var_int_size(tx.outputs.len() as u64)
        + outputs
        + 4
}

/// Header size in the canonical encoding.
pub const HEADER_SIZE: usize = 80;

/// Canonical 80-byte header encoding.
pub fn encode_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&header.version.to_le_bytes());
    out[4..36].copy_from_slice(header.prev_hash.as_bytes());
    out[36..68].copy_from_slice(header.merkle_root.as_bytes());
    out[68..72].copy_from_slice(&header.time.to_le_bytes());
    out[72..76].copy_from_slice(&header.bits.to_le_bytes());
    out[76..80].copy_from_slice(&header.nonce.to_le_bytes());
    out
}

/// Canonical block size: header, var-int tx count, transactions.
pub fn block_size(block: &Block) -> usize {
    HEADER_SIZE
        + var_int_size(block.transactions.len() as u64)
        + block.transactions.iter().map(tx_size).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash256, TxOutputKey};

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxInput {
                prev_output: TxOutputKey::new(Hash256([0x42; 32]), 7),
                script_sig: vec![0xAA; 5],
                sequence: 0xFFFF_FFFE,
            }],
            outputs: vec![TxOutput { value: 99, script_pubkey: vec![0xBB; 3] }],
            lock_time: 500,
        }
    }

    #[test]
    fn var_int_boundaries() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (0xFC, 1),
            (0xFD, 3),
            (0xFFFF, 3),
            (0x1_0000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
            (u64::MAX, 9),
        ];
        for &(value, size) in cases {
            let mut out = Vec::new();
            write_var_int(&mut out, value);
            assert_eq!(out.len(), size, "var-int {value}");
            assert_eq!(var_int_size(value), size);
        }
    }

    #[test]
    fn tx_size_matches_encoding() {
        let tx = sample_tx();
        assert_eq!(encode_tx(&tx).len(), tx_size(&tx));
    }

    #[test]
    fn tx_encoding_layout() {
        let tx = sample_tx();
        let bytes = encode_tx(&tx);
        // version LE at the front, lock_time LE at the back.
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[bytes.len() - 4..], &500u32.to_le_bytes());
        // one input: count byte then 32-byte prev hash.
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..37], &[0x42; 32]);
    }

    #[test]
    fn header_encoding_is_80_bytes() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256([1; 32]),
            merkle_root: Hash256([2; 32]),
            time: 3,
            bits: 4,
            nonce: 5,
        };
        let bytes = encode_header(&header);
        assert_eq!(bytes.len(), 80);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[76..80], &5u32.to_le_bytes());
    }

    #[test]
    fn block_size_includes_var_int_count() {
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![sample_tx()],
        };
        assert_eq!(block.encoded_size(), 80 + 1 + tx_size(&sample_tx()));
    }
}
