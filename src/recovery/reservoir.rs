//! Fixed-size uniform sample of an unbounded stream (Algorithm R)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: usize,
    seen: u64,
    samples: Vec<u64>,
    rng: StdRng,
}

impl Reservoir {
    /// A seeded reservoir gives the same sample for the same input stream
    pub fn new(capacity: usize, seed: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: 0,
            samples: Vec::with_capacity(capacity.min(1024)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn insert(&mut self, value: u64) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if let Some(sample) = self.samples.get_mut(slot as usize) {
            *sample = value;
        }
    }

    /// Nearest-rank percentile of the sample, `p` in [0, 100]
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted.get(rank.saturating_sub(1)).copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Values offered so far, sampled or not
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_everything_below_capacity() {
        let mut reservoir = Reservoir::new(10, 1);
        for value in 1..=5 {
            reservoir.insert(value);
        }
        assert_eq!(reservoir.len(), 5);
        assert_eq!(reservoir.percentile(50.0), Some(3));
        assert_eq!(reservoir.percentile(100.0), Some(5));
        assert_eq!(reservoir.percentile(0.0), Some(1));
    }

    #[test]
    fn test_bounded_memory() {
        let mut reservoir = Reservoir::new(100, 7);
        for value in 0..10_000 {
            reservoir.insert(value);
        }
        assert_eq!(reservoir.len(), 100);
        assert_eq!(reservoir.seen(), 10_000);
        // A uniform sample of 0..10000 has its median near the middle.
        let median = reservoir.percentile(50.0).unwrap();
        assert!((2_000..8_000).contains(&median));
    }

    #[test]
    fn test_same_seed_same_sample() {
        let mut a = Reservoir::new(16, 42);
        let mut b = Reservoir::new(16, 42);
        for value in 0..1_000 {
            a.insert(value);
            b.insert(value);
        }
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn test_empty_percentile() {
        assert_eq!(Reservoir::new(4, 0).percentile(95.0), None);
    }
}
