//! Blocked Bloom filter remembering locally anchored units.
//!
//! Write-mostly and false-positive tolerant: a false positive only causes a
//! movable unit to be skipped from candidacy for a while. False negatives
//! never occur.
//!
//! Layout: an array of 32-bit blocks. Each key derives a block index from
//! the low bits of a 64-bit hash and two bit-masks from a rotated copy of
//! the same hash, then sets/tests the masks in two adjacent blocks. Spreading
//! every key over two blocks disperses clustered keys better than a
//! single-block scheme at the same size.

use crate::ids::{hash64, UnitId};

/// Supported false-positive band.
const MIN_ERROR_RATE: f64 = 0.001;
const MAX_ERROR_RATE: f64 = 0.01;

/// Bits set per block (two blocks per key).
const BITS_PER_MASK: u32 = 4;

const BLOCK_BITS: usize = 32;

const HASH_SEED: u64 = 0x51_7e0a_2b8c_94d3;

const LN2_SQUARED: f64 = core::f64::consts::LN_2 * core::f64::consts::LN_2;

/// The flat-array capacity formula under-sizes blocked layouts, increasingly
/// so at low rates. Quadratic fit over measured blocked-filter rates; the
/// filter is sized for this lower design rate instead of the configured one.
fn corrected_error_rate(rate: f64) -> f64 {
    25.0 * rate * rate + 0.25 * rate
}

#[derive(Debug)]
pub struct BlockedBloomFilter {
    blocks: Vec<u32>,
    block_mask: u64,
}

impl BlockedBloomFilter {
    /// Creates a filter sized for `capacity` keys at `max_error_rate`.
    ///
    /// Fails when the rate is outside the supported [0.1%, 1%] band or the
    /// capacity is zero.
    pub fn new(capacity: usize, max_error_rate: f64) -> anyhow::Result<Self> {
        if !(MIN_ERROR_RATE..=MAX_ERROR_RATE).contains(&max_error_rate) {
            anyhow::bail!(
                "anchoring filter error rate {max_error_rate} outside supported range \
                 [{MIN_ERROR_RATE}, {MAX_ERROR_RATE}]"
            );
        }
        if capacity == 0 {
            anyhow::bail!("anchoring filter capacity must be greater than zero");
        }

        let design_rate = corrected_error_rate(max_error_rate);
        let bits_per_key = (-design_rate.ln() / LN2_SQUARED).ceil() as usize;
        let total_bits = capacity.saturating_mul(bits_per_key).max(BLOCK_BITS);
        let block_count = total_bits.div_ceil(BLOCK_BITS).next_power_of_two();

        Ok(Self {
            blocks: vec![0; block_count],
            block_mask: (block_count - 1) as u64,
        })
    }

    pub fn add(&mut self, unit: &UnitId) {
        let (first, second, mask_a, mask_b) = self.positions(unit);
        self.blocks[first] |= mask_a;
        self.blocks[second] |= mask_b;
    }

    pub fn contains(&self, unit: &UnitId) -> bool {
        let (first, second, mask_a, mask_b) = self.positions(unit);
        self.blocks[first] & mask_a == mask_a && self.blocks[second] & mask_b == mask_b
    }

    /// Forgets every key, e.g. when counters are reset after a significant
    /// membership change.
    pub fn reset(&mut self) {
        self.blocks.fill(0);
    }

    fn positions(&self, unit: &UnitId) -> (usize, usize, u32, u32) {
        let hash = hash64(unit, HASH_SEED);
        let first = (hash & self.block_mask) as usize;
        let second = ((hash & self.block_mask) as usize + 1) & self.block_mask as usize;
        let rotated = hash.rotate_left(21);
        (
            first,
            second,
            spread_mask(rotated),
            spread_mask(rotated >> 20),
        )
    }
}

/// Expands hash bits into a block mask with up to [`BITS_PER_MASK`] set bits.
fn spread_mask(mut bits: u64) -> u32 {
    let mut mask = 0u32;
    for _ in 0..BITS_PER_MASK {
        mask |= 1 << (bits & 31);
        bits >>= 5;
    }
    mask
}
