//! HyperLogLog engine: dense 8-bit registers, classic bias corrections.

use std::hash::BuildHasher;

use carmine_errors::{CarmineError, CarmineResult};

/// Default precision: 2^14 registers, ~0.8% standard error.
pub const DEFAULT_PRECISION: u8 = 14;

fn hasher() -> ahash::RandomState {
    // Fixed seeds so register contents are stable across clones, merges,
    // and restarts.
    ahash::RandomState::with_seeds(
        0x9e37_79b9_7f4a_7c15,
        0xf39c_c060_5ced_c834,
        0x1082_276b_f3a2_7251,
        0x8684_bcd1_2c8e_9d2d,
    )
}

#[derive(Debug, Clone)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        HyperLogLog::new(DEFAULT_PRECISION)
    }
}

impl HyperLogLog {
    pub fn new(precision: u8) -> Self {
        HyperLogLog {
            precision,
            registers: vec![0u8; 1usize << precision],
        }
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// `PFADD` for one element. Returns whether any register grew.
    pub fn add(&mut self, item: &[u8]) -> bool {
        let hash = hasher().hash_one(item);
        let index = (hash >> (64 - self.precision)) as usize;
        let remainder = hash << self.precision;
        let max_rank = 64 - self.precision as u32;
        let rank = (remainder.leading_zeros() + 1).min(max_rank) as u8;
        if rank > self.registers[index] {
            self.registers[index] = rank;
            true
        } else {
            false
        }
    }

    fn alpha(m: usize) -> f64 {
        match m {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m as f64),
        }
    }

    /// `PFCOUNT` estimate: raw harmonic-mean estimate, linear counting for
    /// the small range, and the 2³² correction for the large range.
    pub fn count(&self) -> u64 {
        let m = self.registers.len();
        let mut sum = 0.0f64;
        let mut zeros = 0usize;
        for &reg in &self.registers {
            sum += (2.0f64).powi(-i32::from(reg));
            if reg == 0 {
                zeros += 1;
            }
        }
        let raw = Self::alpha(m) * (m as f64) * (m as f64) / sum;
        let two_pow_32 = 4_294_967_296.0f64;
        let estimate = if raw <= 2.5 * m as f64 && zeros > 0 {
            (m as f64) * (m as f64 / zeros as f64).ln()
        } else if raw > two_pow_32 / 30.0 {
            -two_pow_32 * (1.0 - raw / two_pow_32).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }

    /// `PFMERGE`: register-wise max. Precisions must match.
    pub fn merge(&mut self, other: &HyperLogLog) -> CarmineResult<()> {
        if self.precision != other.precision {
            return Err(CarmineError::HllPrecisionMismatch);
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
        Ok(())
    }
}
