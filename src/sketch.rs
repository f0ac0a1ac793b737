//! Count-min sketch of 4-bit counters estimating how often a page id was seen.
//!
//! Each `u64` word packs sixteen counters. A key selects one group of four
//! counters inside each of four words; the estimate is the minimum of the
//! four. After `sample_size` increments every counter is halved so the
//! sketch tracks recent popularity rather than all-time totals.

const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

const RESET_MASK: u64 = 0x7777_7777_7777_7777;
const ONE_MASK: u64 = 0x1111_1111_1111_1111;

/// Largest value a counter can hold.
pub(crate) const MAX_FREQUENCY: u8 = 15;

pub(crate) struct FrequencySketch {
    table: Box<[u64]>,
    table_mask: u64,
    sample_size: u32,
    size: u32,
}

impl FrequencySketch {
    /// Sketch sized for a cache holding `maximum` entries.
    pub fn with_capacity(maximum: usize) -> Self {
        let maximum = maximum.clamp(1, 1 << 30);
        let table_size = maximum.next_power_of_two();
        let sample_size = (10 * maximum).min(i32::MAX as usize) as u32;

        Self {
            table: vec![0; table_size].into_boxed_slice(),
            table_mask: (table_size - 1) as u64,
            sample_size,
            size: 0,
        }
    }

    /// Number of increments between aging passes, also the minimum number of
    /// requests a hit-rate sample needs before it is trusted.
    #[inline]
    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    /// Estimated number of occurrences of `key`, at most [`MAX_FREQUENCY`].
    pub fn frequency(&self, key: i64) -> u8 {
        let hash = spread(key);
        let start = ((hash & 3) << 2) as u32;
        let mut frequency = MAX_FREQUENCY as u64;
        for i in 0..4 {
            let index = self.index_of(hash, i);
            let shift = (start + i as u32) << 2;
            let count = (self.table[index] >> shift) & 0xF;
            frequency = frequency.min(count);
        }
        frequency as u8
    }

    /// Record one occurrence of `key`, aging the sketch when the sample fills.
    pub fn increment(&mut self, key: i64) {
        let hash = spread(key);
        let start = ((hash & 3) << 2) as u32;

        let mut added = false;
        for i in 0..4 {
            let index = self.index_of(hash, i);
            added |= self.increment_at(index, start + i as u32);
        }

        if added {
            self.size += 1;
            if self.size >= self.sample_size {
                self.reset();
            }
        }
    }

    fn increment_at(&mut self, index: usize, counter: u32) -> bool {
        let shift = counter << 2;
        let mask = 0xF_u64 << shift;
        if self.table[index] & mask != mask {
            self.table[index] += 1 << shift;
            true
        } else {
            false
        }
    }

    /// Halve every counter. `size` follows the counter mass, less the odd
    /// remainders the shift drops.
    fn reset(&mut self) {
        let mut odd = 0u32;
        for word in self.table.iter_mut() {
            odd += (*word & ONE_MASK).count_ones();
            *word = (*word >> 1) & RESET_MASK;
        }
        self.size = self.size.saturating_sub(odd >> 2) >> 1;
    }

    #[inline]
    fn index_of(&self, hash: u64, i: usize) -> usize {
        let mut h = hash.wrapping_add(SEEDS[i]).wrapping_mul(SEEDS[i]);
        h = h.wrapping_add(h >> 32);
        (h & self.table_mask) as usize
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    /// Sum of every counter in the table.
    #[cfg(test)]
    fn counter_total(&self) -> u64 {
        self.table
            .iter()
            .map(|word| (0..16).map(|i| (word >> (i * 4)) & 0xF).sum::<u64>())
            .sum()
    }
}

/// Mix a page id so neighbouring ids land on unrelated counters.
#[inline]
fn spread(key: i64) -> u64 {
    let mut x = key as u64;
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_are_counted() {
        let mut sketch = FrequencySketch::with_capacity(512);
        assert_eq!(sketch.frequency(7), 0);
        for expected in 1..=5 {
            sketch.increment(7);
            assert_eq!(sketch.frequency(7), expected);
        }
    }

    #[test]
    fn counters_saturate() {
        let mut sketch = FrequencySketch::with_capacity(512);
        for _ in 0..100 {
            sketch.increment(3);
        }
        assert_eq!(sketch.frequency(3), MAX_FREQUENCY);
    }

    #[test]
    fn reset_halves_counts() {
        let mut sketch = FrequencySketch::with_capacity(64);
        for _ in 0..10 {
            sketch.increment(1);
        }
        assert!(sketch.frequency(1) >= 10);

        let mut key = 1_000;
        loop {
            let size = sketch.size();
            sketch.increment(key);
            key += 1;
            if sketch.size() < size {
                break;
            }
        }
        assert!(sketch.frequency(1) <= MAX_FREQUENCY / 2);
        assert!(sketch.size() < sketch.sample_size());
    }

    #[test]
    fn size_tracks_counters_after_reset() {
        // Distinct keys never saturate, so each increment adds four units
        let mut sketch = FrequencySketch::with_capacity(64);
        let mut key = 0;
        loop {
            let size = sketch.size();
            sketch.increment(key);
            key += 1;
            if sketch.size() < size {
                break;
            }
        }

        let expected = sketch.counter_total() / 4;
        let size = sketch.size() as u64;
        assert!(
            size.abs_diff(expected) <= 1,
            "size {size} drifted from counter mass {expected}"
        );
    }

    #[test]
    fn heavy_hitters_outrank_noise() {
        let mut sketch = FrequencySketch::with_capacity(1024);
        for round in 0..8 {
            sketch.increment(42);
            for noise in 0..50 {
                sketch.increment(10_000 + round * 50 + noise);
            }
        }
        assert!(sketch.frequency(42) > sketch.frequency(10_001));
    }
}
