//! Size and fee arithmetic shared by the reveal sizer and the commit
//! balancer.
//!
//! References:
//! - https://bitcoinops.org/en/tools/calc-size/
//! - https://en.bitcoin.it/wiki/Protocol_documentation#Common_structures

use bitcoin::consensus::encode::VarInt;
use bitcoin::Transaction;

pub(crate) const WITNESS_SCALE_FACTOR: i64 = 4;

// Reveal witness stack placeholders: the Schnorr signature is always 64
// bytes under SIGHASH_DEFAULT, the control block is parity byte plus the
// 32-byte internal key (single leaf, no merkle path).
const SCHNORR_SIGNATURE_SIZE: usize = 64;
const CONTROL_BLOCK_SIZE: usize = 33;

// Segwit marker + flag bytes, paid once a transaction carries witnesses.
const SEGWIT_MARKER_AND_FLAG_SIZE: usize = 2;

/// Weight as consensus defines it: `3 * baseSize + totalSize`.
pub(crate) fn transaction_weight(tx: &Transaction) -> i64 {
    let base_size = tx.base_size() as i64;
    let total_size = tx.total_size() as i64;
    base_size * (WITNESS_SCALE_FACTOR - 1) + total_size
}

/// Virtual size: `ceil(weight / 4)`; the division discounts witness bytes.
pub(crate) fn transaction_vsize(tx: &Transaction) -> i64 {
    (transaction_weight(tx) + (WITNESS_SCALE_FACTOR - 1)) / WITNESS_SCALE_FACTOR
}

/// Serialized size of a witness stack: item-count varint, then each item
/// as varint length plus payload.
fn witness_stack_size(item_sizes: &[usize]) -> usize {
    let mut size = VarInt::from(item_sizes.len() as u64).size();
    for &item in item_sizes {
        size += VarInt::from(item as u64).size() + item;
    }
    size
}

/// Fee the reveal pays for its witness: the discounted size of
/// `[signature, envelope, control block]` plus the marker/flag bytes,
/// rounded like vsize, at `fee_rate` sat/vB.
pub(crate) fn reveal_witness_fee(envelope_size: usize, fee_rate: i64) -> i64 {
    let witness_size = witness_stack_size(&[
        SCHNORR_SIGNATURE_SIZE,
        envelope_size,
        CONTROL_BLOCK_SIZE,
    ]);
    ((witness_size + SEGWIT_MARKER_AND_FLAG_SIZE + 3) as i64 / WITNESS_SCALE_FACTOR) * fee_rate
}
