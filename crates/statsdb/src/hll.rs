//! A compact HyperLogLog cardinality sketch.
//!
//! 1024 byte registers (precision 10, ~3.2% standard error). Register-wise
//! max is a commutative, idempotent merge, which replication relies on.

use std::io::Cursor;

const PRECISION: u32 = 10;
const REGISTERS: usize = 1 << PRECISION;
const HASH_SEED: u32 = 0x5f61_0d0b;

#[derive(Debug, Clone, PartialEq)]
pub struct Hll {
    registers: Vec<u8>,
}

impl Hll {
    pub fn new() -> Hll {
        Hll {
            registers: vec![0u8; REGISTERS],
        }
    }

    pub fn insert(&mut self, item: &str) {
        let hash = murmur3::murmur3_x64_128(&mut Cursor::new(item.as_bytes()), HASH_SEED)
            .unwrap_or_default() as u64;
        let index = (hash >> (64 - PRECISION)) as usize;
        // Rank of the first set bit in the remaining hash bits.
        let remainder = hash << PRECISION;
        let rank = if remainder == 0 {
            (64 - PRECISION + 1) as u8
        } else {
            remainder.leading_zeros() as u8 + 1
        };
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Estimated cardinality, with the standard small-range correction.
    pub fn estimate(&self) -> i64 {
        let m = REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);

        let mut sum = 0.0f64;
        let mut zeros = 0usize;
        for &r in &self.registers {
            sum += 1.0 / f64::powi(2.0, r as i32);
            if r == 0 {
                zeros += 1;
            }
        }

        let raw = alpha * m * m / sum;
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as i64
    }

    pub fn merge(&mut self, other: &Hll) {
        for (a, b) in self.registers.iter_mut().zip(&other.registers) {
            if *b > *a {
                *a = *b;
            }
        }
    }

    pub fn clear(&mut self) {
        self.registers.iter_mut().for_each(|r| *r = 0);
    }
}

impl Default for Hll {
    fn default() -> Self {
        Self::new()
    }
}
