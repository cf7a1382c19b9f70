use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Deterministic, re-seedable, serializable RNG.
///
/// Wraps `ChaCha8Rng` rather than a Mersenne-Twister port of the original
/// implementation: what spec.md requires is reproducibility and a clean
/// state round-trip, not bit-for-bit agreement with a specific generator.
/// `ChaCha8Rng` serializes its full internal state via `rand_chacha`'s
/// `serde1` feature, which gives the round-trip invariant for free.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeterministicRng {
    seed: u64,
    inner: ChaCha8Rng,
}

impl DeterministicRng {
    /// Seed the generator directly. A seed of `0` is treated by the caller
    /// (see `World::new`) as "draw a fresh seed from OS entropy"; this
    /// constructor always uses exactly the seed it is given.
    pub fn from_seed(seed: u64) -> Self {
        Self { seed, inner: ChaCha8Rng::seed_from_u64(seed) }
    }

    /// The seed this generator was constructed with (not its current
    /// internal state), persisted verbatim in `[RandomState]`.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Draw a uniform value in `[0, 1)`.
    pub fn next_uniform(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    /// Draw an integer uniformly in `[0, n)`. Panics if `n == 0`.
    pub fn next_index(&mut self, n: usize) -> usize {
        self.inner.gen_range(0..n)
    }

    /// Draw from a normal distribution with the given mean and standard
    /// deviation (used for Gaussian trap-potential perturbation).
    pub fn next_normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        if std_dev <= 0.0 {
            return mean;
        }
        let dist = Normal::new(mean, std_dev).expect("std_dev > 0 checked above");
        dist.sample(&mut self.inner)
    }

    /// `true` with probability `p`, clamped to `[0, 1]`.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_uniform() < p.clamp(0.0, 1.0)
    }

    /// Deterministically derive a per-task substream for parallel carrier
    /// evaluation. See spec.md §5: "each task draws from a deterministic
    /// per-task substream derived from the master state". The substream is
    /// `ChaCha8` seeded from a hash of `(self.seed, ordinal)`, so the same
    /// `(seed, tick, ordinal)` triple always yields the same draws
    /// regardless of how many worker threads are available.
    pub fn fork(&self, ordinal: u64) -> DeterministicRng {
        let mixed = splitmix64(self.seed ^ ordinal.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        DeterministicRng { seed: mixed, inner: ChaCha8Rng::seed_from_u64(mixed) }
    }
}

/// A cheap, well-distributed integer mixer used to derive substream seeds
/// without pulling in another RNG crate solely for seed derivation.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_subsequent_draws() {
        let mut original = DeterministicRng::from_seed(42);
        let before: Vec<f64> = (0..8).map(|_| original.next_uniform()).collect();

        let bytes = bincode::serialize(&original).unwrap();
        let mut restored: DeterministicRng = bincode::deserialize(&bytes).unwrap();
        let after: Vec<f64> = (0..8).map(|_| restored.next_uniform()).collect();

        // Draw eight more from `original` too, to compare apples to apples:
        // `before` was already consumed, so re-derive a fresh reference rng.
        let mut reference = DeterministicRng::from_seed(42);
        let _: Vec<f64> = (0..8).map(|_| reference.next_uniform()).collect();
        let reference_after: Vec<f64> = (0..8).map(|_| reference.next_uniform()).collect();

        assert_eq!(after, reference_after);
        assert_eq!(before.len(), 8);
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = DeterministicRng::from_seed(7);
        let mut b = DeterministicRng::from_seed(7);
        for _ in 0..16 {
            assert_eq!(a.next_uniform(), b.next_uniform());
        }
    }

    #[test]
    fn fork_is_deterministic_and_distinct() {
        let base = DeterministicRng::from_seed(7);
        let mut f1 = base.fork(3);
        let mut f2 = base.fork(3);
        let mut f3 = base.fork(4);
        assert_eq!(f1.next_uniform(), f2.next_uniform());
        assert_ne!(base.fork(3).next_uniform(), f3.next_uniform());
    }
}
