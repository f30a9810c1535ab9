//! Deterministic random number generation.
//!
//! RULE: Nothing in the core may call a platform RNG.
//! The genetic algorithm, jitter helpers and scenario tooling all draw
//! from `CoreRng` streams derived from an explicit seed, so the same
//! seed and input always reproduce the same route.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// Stable stream assignments. NEVER reorder or remove entries — only
/// append. Reordering changes every consumer's stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum RngStream {
    Genetic = 0,
    Jitter = 1,
    Scenario = 2,
    // Add new streams here — append only.
}

/// A named, deterministic RNG for a single consumer.
pub struct CoreRng {
    inner: Pcg64Mcg,
}

impl CoreRng {
    /// Derive a stream RNG from the master seed and a stable stream id.
    pub fn for_stream(master_seed: u64, stream: RngStream) -> Self {
        let derived = master_seed ^ (stream as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self { inner: Pcg64Mcg::seed_from_u64(derived) }
    }

    /// Seed directly, for per-call determinism (the route engine derives
    /// a fresh RNG per optimization so concurrent calls can't interleave
    /// each other's draws).
    pub fn from_seed(seed: u64) -> Self {
        Self { inner: Pcg64Mcg::seed_from_u64(seed) }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Draw a raw u64 (full range).
    pub fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.inner.next_u64()
    }

    /// Roll a usize in [0, n).
    pub fn below(&mut self, n: usize) -> usize {
        use rand::RngCore;
        assert!(n > 0, "n must be > 0");
        (self.inner.next_u64() % n as u64) as usize
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Multiply `base` by a factor in [1-spread, 1+spread].
    pub fn jitter(&mut self, base: f64, spread: f64) -> f64 {
        base * (1.0 + spread * (2.0 * self.next_f64() - 1.0))
    }

    /// Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = CoreRng::for_stream(42, RngStream::Genetic);
        let mut b = CoreRng::for_stream(42, RngStream::Genetic);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn streams_diverge() {
        let mut a = CoreRng::for_stream(42, RngStream::Genetic);
        let mut b = CoreRng::for_stream(42, RngStream::Jitter);
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = CoreRng::from_seed(7);
        let mut items: Vec<u32> = (0..20).collect();
        rng.shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }
}
