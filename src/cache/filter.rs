//! Probabilistic existence gate for entity ids.
//!
//! A bloom filter over `i64` ids. Bits live in atomics, so `add` and `might_exist` run
//! concurrently from any number of tasks without a lock. Bits are only ever set, never cleared:
//! once an id is added every later lookup finds all of its bits.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::keys::hash_value;

const WORD_BITS: u64 = 64;

/// Sizing inputs for an [`ExistenceFilter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSizing {
    pub expected_items: usize,
    pub false_positive_rate: f64,
    pub hash_rounds: u32,
}

impl Default for FilterSizing {
    fn default() -> Self {
        Self {
            expected_items: 1_000_000,
            false_positive_rate: 0.01,
            hash_rounds: 5,
        }
    }
}

impl FilterSizing {
    /// Bit count that reaches the target false-positive rate with a fixed number of rounds.
    ///
    /// `m = -k * n / ln(1 - p^(1/k))`
    pub fn bit_count(&self) -> u64 {
        let n = self.expected_items.max(1) as f64;
        let k = f64::from(self.hash_rounds.max(1));
        let p = self.false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
        let bits = -k * n / (1.0 - p.powf(1.0 / k)).ln();
        (bits.ceil() as u64).max(WORD_BITS)
    }
}

#[derive(Debug)]
pub struct ExistenceFilter {
    words: Vec<AtomicU64>,
    bits: u64,
    rounds: u32,
    added: AtomicUsize,
}

impl ExistenceFilter {
    pub fn new(sizing: FilterSizing) -> Self {
        let bits = sizing.bit_count();
        let word_count = bits.div_ceil(WORD_BITS) as usize;
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            bits: word_count as u64 * WORD_BITS,
            rounds: sizing.hash_rounds.max(1),
            added: AtomicUsize::new(0),
        }
    }

    /// Build a filter and add every id from the iterator.
    pub fn load_from(sizing: FilterSizing, ids: impl IntoIterator<Item = i64>) -> Self {
        let filter = Self::new(sizing);
        for id in ids {
            filter.add(id);
        }
        filter
    }

    pub fn add(&self, id: i64) {
        for position in self.positions(id) {
            let (word, mask) = locate(position);
            self.words[word].fetch_or(mask, Ordering::Release);
        }
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    /// `false` means the id was never added. `true` may be a false positive.
    pub fn might_exist(&self, id: i64) -> bool {
        self.positions(id).all(|position| {
            let (word, mask) = locate(position);
            self.words[word].load(Ordering::Acquire) & mask != 0
        })
    }

    /// Number of `add` calls so far, duplicates included.
    pub fn added(&self) -> usize {
        self.added.load(Ordering::Relaxed)
    }

    pub fn bit_len(&self) -> u64 {
        self.bits
    }

    fn positions(&self, id: i64) -> impl Iterator<Item = u64> + '_ {
        // Double hashing: h1 + i * h2, with h2 forced odd so the bit positions never collapse.
        let h1 = hash_value(&(0u8, id));
        let h2 = hash_value(&(1u8, id)) | 1;
        (0..u64::from(self.rounds))
            .map(move |round| h1.wrapping_add(round.wrapping_mul(h2)) % self.bits)
    }
}

fn locate(position: u64) -> (usize, u64) {
    ((position / WORD_BITS) as usize, 1u64 << (position % WORD_BITS))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn small() -> FilterSizing {
        FilterSizing {
            expected_items: 10_000,
            false_positive_rate: 0.01,
            hash_rounds: 5,
        }
    }

    #[test]
    fn default_sizing_matches_million_items_at_one_percent() {
        let bits = FilterSizing::default().bit_count();
        assert!((9_500_000..10_200_000).contains(&bits), "bits = {bits}");
    }

    #[test]
    fn added_ids_are_always_reported() {
        let filter = ExistenceFilter::load_from(small(), 1..=5_000);
        assert!((1..=5_000).all(|id| filter.might_exist(id)));
        assert_eq!(filter.added(), 5_000);
    }

    #[test]
    fn empty_filter_rejects_everything() {
        let filter = ExistenceFilter::new(small());
        assert!(!filter.might_exist(0));
        assert!(!filter.might_exist(42));
        assert!(!filter.might_exist(i64::MIN));
    }

    #[test]
    fn false_positive_rate_stays_near_target() {
        let filter = ExistenceFilter::load_from(small(), 0..10_000);
        let false_hits = (1_000_000..1_100_000)
            .filter(|id| filter.might_exist(*id))
            .count();
        // 1% target over 100k lookups; leave headroom for hash variance.
        assert!(false_hits < 3_000, "false positives = {false_hits}");
    }

    #[test]
    fn concurrent_adds_never_lose_members() {
        let filter = Arc::new(ExistenceFilter::new(small()));
        let handles: Vec<_> = (0..8i64)
            .map(|worker| {
                let filter = Arc::clone(&filter);
                std::thread::spawn(move || {
                    for id in (worker * 1_000)..((worker + 1) * 1_000) {
                        filter.add(id);
                        assert!(filter.might_exist(id));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert!((0..8_000).all(|id| filter.might_exist(id)));
    }
}
