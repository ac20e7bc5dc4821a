//! Proof-of-work target math: compact-bits codec, per-header work, and the
//! hash-vs-target check.
//!
//! Targets are 256-bit unsigned integers; the header's `bits` field is the
//! compact (mantissa/exponent) encoding. Per-header work approximates
//! `2^256 / (target + 1)`, and cumulative work summed from genesis is the
//! fork-choice metric.

use primitive_types::U256;

use crate::constants::POW_LIMIT_BITS;
use crate::types::{BlockHeader, Hash256};

/// Decode a compact-bits target.
///
/// Returns `None` for negative encodings, mantissa overflow, or a zero
/// target — all of which make the header unconditionally invalid.
pub fn target_from_bits(bits: u32) -> Option<U256> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007F_FFFF;

    // The sign bit has no legitimate use in a target.
    if bits & 0x0080_0000 != 0 {
        return None;
    }
    if mantissa == 0 {
        return None;
    }
    // Mantissa shifted past 256 bits.
    if exponent > 34
        || (mantissa > 0xFF && exponent > 33)
        || (mantissa > 0xFFFF && exponent > 32)
    {
        return None;
    }

    let target = if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        U256::from(mantissa) << (8 * (exponent - 3))
    };
    if target.is_zero() { None } else { Some(target) }
}

/// Encode a target in compact form. Inverse of [`target_from_bits`] for
/// targets representable without mantissa truncation.
pub fn bits_from_target(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let mut size = (target.bits() as u32).div_ceil(8);
    let mut compact: u32 = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u64() as u32
    };
    // Avoid setting the sign bit; shift the mantissa down instead.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Per-header work: `2^256 / (target + 1)`, computed as `~t / (t + 1) + 1`
/// to stay within 256 bits.
///
/// Invalid bits contribute zero work, so a header carrying them can never
/// extend a best chain.
pub fn work_from_bits(bits: u32) -> U256 {
    let Some(target) = target_from_bits(bits) else {
        return U256::zero();
    };
    if target == U256::MAX {
        return U256::one();
    }
    (!target) / (target + U256::one()) + U256::one()
}

/// The easiest target any header may claim.
pub fn pow_limit() -> U256 {
    target_from_bits(POW_LIMIT_BITS).expect("pow limit bits are a valid constant encoding")
}

/// Interpret a hash as a little-endian 256-bit integer.
pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_little_endian(hash.as_bytes())
}

/// Check that a header's hash satisfies its own claimed difficulty and that
/// the claimed target does not exceed the chain's pow limit.
pub fn check_proof_of_work(header: &BlockHeader) -> bool {
    match target_from_bits(header.bits) {
        Some(target) => {
            target <= pow_limit() && hash_to_u256(&header.hash()) <= target
        }
        None => false,
    }
}
