//! Bloom filter engine.
//!
//! Sizing follows the textbook formulas: for requested capacity n and error
//! rate p, the bit count is m = ⌈−n·ln p / (ln 2)²⌉ rounded up to a multiple
//! of 64, and the hash count is k = round((m/n)·ln 2), at least 1. Instead
//! of k independent hash functions, positions derive from two fixed-seed
//! 64-bit hashes by double hashing: hᵢ = h₁ + i·h₂ (mod m).

use std::hash::BuildHasher;

use carmine_errors::{CarmineError, CarmineResult};

/// Defaults applied when `BF.ADD` creates a filter without a prior
/// `BF.RESERVE`.
pub const DEFAULT_ERROR_RATE: f64 = 0.01;
pub const DEFAULT_CAPACITY: u64 = 100;

fn base_hashers() -> (ahash::RandomState, ahash::RandomState) {
    // Fixed seeds: filter state must hash identically across restarts and
    // across the COW clones the snapshot path takes.
    (
        ahash::RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        ),
        ahash::RandomState::with_seeds(
            0x4528_21e6_38d0_1377,
            0xbe54_66cf_34e9_0c6c,
            0xc0ac_29b7_c97c_50dd,
            0x3f84_d5b5_b547_0917,
        ),
    )
}

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    nbits: u64,
    hashes: u32,
    capacity: u64,
    error_rate: f64,
    items: u64,
}

impl Default for BloomFilter {
    fn default() -> Self {
        // Infallible: the default parameters are in range.
        BloomFilter::with_params(DEFAULT_ERROR_RATE, DEFAULT_CAPACITY)
            .unwrap_or_else(|_| unreachable!("default bloom parameters are valid"))
    }
}

impl BloomFilter {
    pub fn with_params(error_rate: f64, capacity: u64) -> CarmineResult<Self> {
        if !(error_rate > 0.0 && error_rate < 1.0) {
            return Err(CarmineError::BloomErrorRate);
        }
        if capacity == 0 {
            return Err(CarmineError::BloomCapacity);
        }
        let ln2 = std::f64::consts::LN_2;
        let raw_bits = (-(capacity as f64) * error_rate.ln() / (ln2 * ln2)).ceil();
        let nbits = ((raw_bits as u64).max(1)).div_ceil(64) * 64;
        let hashes = ((nbits as f64 / capacity as f64) * ln2).round().max(1.0) as u32;
        Ok(BloomFilter {
            bits: vec![0u64; (nbits / 64) as usize],
            nbits,
            hashes,
            capacity,
            error_rate,
            items: 0,
        })
    }

    fn positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let (s1, s2) = base_hashers();
        let h1 = s1.hash_one(item);
        let h2 = s2.hash_one(item);
        let nbits = self.nbits;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % nbits)
    }

    fn get(&self, pos: u64) -> bool {
        self.bits[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0
    }

    fn set(&mut self, pos: u64) {
        self.bits[(pos / 64) as usize] |= 1u64 << (pos % 64);
    }

    /// `BF.ADD`: returns `true` when the item was definitely absent (some
    /// bit was still clear). Bits are set unconditionally either way.
    pub fn add(&mut self, item: &[u8]) -> bool {
        let positions: Vec<u64> = self.positions(item).collect();
        let mut added = false;
        for &pos in &positions {
            if !self.get(pos) {
                added = true;
            }
            self.set(pos);
        }
        if added {
            self.items += 1;
        }
        added
    }

    /// `BF.EXISTS`: false positives at roughly the requested rate, never
    /// false negatives.
    pub fn contains(&self, item: &[u8]) -> bool {
        self.positions(item).all(|pos| self.get(pos))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    pub fn num_hashes(&self) -> u32 {
        self.hashes
    }

    pub fn size_in_bits(&self) -> u64 {
        self.nbits
    }

    pub fn items_inserted(&self) -> u64 {
        self.items
    }
}
