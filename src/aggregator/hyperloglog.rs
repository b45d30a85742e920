//! HyperLogLog cardinality sketch for unique-error and affected-user counts.
//!
//! Error bound: the relative standard error is `1.04 / sqrt(2^precision)`.
//! At the default precision of 10 (1024 one-byte registers) that is about
//! 3.25%. Small cardinalities use linear counting and are close to exact.

use serde::{Deserialize, Serialize};

/// Default precision parameter (log2 of register count).
pub const DEFAULT_HLL_PRECISION: u8 = 10;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    /// Create a new sketch with the given precision (4 ≤ p ≤ 16).
    pub fn new(precision: u8) -> Self {
        let p = precision.clamp(4, 16);
        Self {
            precision: p,
            registers: vec![0u8; 1usize << p],
        }
    }

    /// Insert a pre-computed, well-mixed 64-bit hash.
    pub fn insert_hash(&mut self, hash: u64) {
        let m = self.registers.len();
        let idx = (hash as usize) & (m - 1);
        let remaining = hash >> self.precision;
        let rho = if remaining == 0 {
            64 - self.precision + 1
        } else {
            remaining.trailing_zeros() as u8 + 1
        };
        self.registers[idx] = self.registers[idx].max(rho);
    }

    /// Fold another sketch of the same precision into this one.
    ///
    /// Sketches of different precision are ignored; every sketch in the crate
    /// is built with `DEFAULT_HLL_PRECISION`.
    pub fn merge(&mut self, other: &HyperLogLog) {
        if other.precision != self.precision {
            return;
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            *mine = (*mine).max(*theirs);
        }
    }

    /// Estimate the number of distinct hashes inserted.
    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2.0_f64.powi(-(r as i32)))
            .sum();
        let raw_estimate = self.alpha_m() * m * m / sum;

        // Small-range correction
        if raw_estimate <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count() as f64;
            if zeros > 0.0 {
                return m * (m / zeros).ln();
            }
        }

        raw_estimate
    }

    /// Estimated cardinality, rounded.
    pub fn count(&self) -> u64 {
        self.estimate().round() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    fn alpha_m(&self) -> f64 {
        let m = self.registers.len();
        match m {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m as f64),
        }
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new(DEFAULT_HLL_PRECISION)
    }
}
