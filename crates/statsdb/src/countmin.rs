//! A count-min sketch for per-item frequency estimates.
//!
//! 4 rows of 1024 saturating u32 counters. Element-wise addition is the
//! merge operator, so window aggregation and replication both commute.

use std::io::Cursor;

const DEPTH: usize = 4;
const WIDTH: usize = 1024;
const ROW_SEEDS: [u32; DEPTH] = [0x9747_b28c, 0x1b87_3593, 0xcc9e_2d51, 0x8564_9f3d];

#[derive(Debug, Clone, PartialEq)]
pub struct CountMin {
    rows: Vec<u32>,
}

impl CountMin {
    pub fn new() -> CountMin {
        CountMin {
            rows: vec![0u32; DEPTH * WIDTH],
        }
    }

    fn index(item: &str, row: usize) -> usize {
        let hash = murmur3::murmur3_32(&mut Cursor::new(item.as_bytes()), ROW_SEEDS[row])
            .unwrap_or_default();
        row * WIDTH + (hash as usize % WIDTH)
    }

    pub fn insert(&mut self, item: &str, count: u32) {
        for row in 0..DEPTH {
            let i = Self::index(item, row);
            self.rows[i] = self.rows[i].saturating_add(count);
        }
    }

    /// Estimated count of `item`: an upper bound, exact absent collisions.
    pub fn estimate(&self, item: &str) -> i64 {
        (0..DEPTH)
            .map(|row| self.rows[Self::index(item, row)])
            .min()
            .unwrap_or(0) as i64
    }

    pub fn merge(&mut self, other: &CountMin) {
        for (a, b) in self.rows.iter_mut().zip(&other.rows) {
            *a = a.saturating_add(*b);
        }
    }

    pub fn clear(&mut self) {
        self.rows.iter_mut().for_each(|c| *c = 0);
    }
}

impl Default for CountMin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_are_upper_bounds() {
        let mut cm = CountMin::new();
        cm.insert("203.0.113.5", 3);
        cm.insert("203.0.113.5", 2);
        cm.insert("198.51.100.7", 1);

        assert!(cm.estimate("203.0.113.5") >= 5);
        assert!(cm.estimate("198.51.100.7") >= 1);
        assert_eq!(cm.estimate("absent"), 0);
    }

    #[test]
    fn merge_adds_counts() {
        let mut a = CountMin::new();
        let mut b = CountMin::new();
        a.insert("k", 2);
        b.insert("k", 3);

        let mut merged = a.clone();
        merged.merge(&b);
        assert!(merged.estimate("k") >= 5);

        let mut other = b.clone();
        other.merge(&a);
        assert_eq!(merged, other);
    }
}
