// Deterministic, portable pseudo-random number generator for game rules.
//
// Implements xoshiro256++ (Blackman & Vigna, 2019) with SplitMix64 seeding.
// Every peer mirroring a game must draw the exact same values in the exact
// same order, so the generator is hand-rolled and platform-independent.
//
// A game's generator is never seeded locally. Each participant contributes a
// value through an ordered input round (see `gamesync_core::game`), and
// `derive_seed` folds the contributions, in seating order, into one `u64`.
// Any peer that saw the same contributions builds the same generator.
//
// **Critical constraint: determinism.** Every method on `GameRng` must produce
// identical output given the same prior state, regardless of platform,
// compiler version, or optimization level. No floating point in the core
// generator and no other source of randomness in this module.

use serde::{Deserialize, Serialize};

/// Xoshiro256++ PRNG, one instance per running game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRng {
    s: [u64; 4],
}

impl GameRng {
    /// Create a new PRNG seeded from a `u64`.
    ///
    /// Uses SplitMix64 to expand the seed into the 256-bit internal state.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    /// Generate the next `u64` in the sequence.
    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);

        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];

        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    /// Upper 32 bits of the next `u64`.
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Generate a uniform random integer in `[low, high)`.
    ///
    /// Uses rejection sampling to avoid modulo bias.
    /// Panics if `low >= high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "range_u64: low must be less than high");
        let span = high - low;
        if span.is_power_of_two() {
            return low + (self.next_u64() & (span - 1));
        }
        let threshold = span.wrapping_neg() % span;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return low + (r % span);
            }
        }
    }

    /// Uniform `usize` in `[low, high)`. Panics if `low >= high`.
    pub fn range_usize(&mut self, low: usize, high: usize) -> usize {
        self.range_u64(low as u64, high as u64) as usize
    }

    /// Return `true` with probability `numerator / denominator`.
    ///
    /// Integer-only so that card and dice rules never touch floating point.
    /// Panics if `denominator == 0`.
    pub fn chance(&mut self, numerator: u64, denominator: u64) -> bool {
        assert!(denominator > 0, "chance: denominator must be positive");
        if numerator >= denominator {
            return true;
        }
        self.range_u64(0, denominator) < numerator
    }

    /// Pick a uniformly random element, or `None` for an empty slice.
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.range_usize(0, items.len());
        items.get(idx)
    }

    /// Fisher–Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.range_usize(0, i + 1);
            items.swap(i, j);
        }
    }
}

/// Fold per-participant seed contributions into a single game seed.
///
/// Order matters: callers pass contributions in seating order so every peer
/// derives the same value. An empty slice yields a fixed seed.
pub fn derive_seed(contributions: &[u64]) -> u64 {
    let mut state = 0x6761_6d65_7379_6e63; // "gamesync"
    for (i, c) in contributions.iter().enumerate() {
        state ^= c.rotate_left((i % 64) as u32);
        state = splitmix64(&mut state);
    }
    state
}

/// SplitMix64, used for seeding xoshiro256++ and mixing contributions.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn determinism_same_seed_same_output() {
        let mut a = GameRng::new(42);
        let mut b = GameRng::new(42);
        for _ in 0..1000 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_seeds_different_output() {
        let mut a = GameRng::new(42);
        let mut b = GameRng::new(43);
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn range_u64_within_bounds() {
        let mut rng = GameRng::new(999);
        for _ in 0..10_000 {
            let v = rng.range_u64(10, 20);
            assert!((10..20).contains(&v), "range_u64 out of range: {v}");
        }
    }

    #[test]
    fn chance_extremes() {
        let mut rng = GameRng::new(7);
        for _ in 0..100 {
            assert!(!rng.chance(0, 6));
            assert!(rng.chance(6, 6));
        }
    }

    #[test]
    fn choose_empty_is_none() {
        let mut rng = GameRng::new(1);
        let empty: [u8; 0] = [];
        assert_eq!(rng.choose(&empty), None);
        assert_eq!(rng.choose(&[5]), Some(&5));
    }

    #[test]
    fn shuffle_is_a_permutation_and_deterministic() {
        let mut deck: Vec<u32> = (0..52).collect();
        let mut again = deck.clone();
        GameRng::new(2024).shuffle(&mut deck);
        GameRng::new(2024).shuffle(&mut again);
        assert_eq!(deck, again);

        let mut sorted = deck.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..52).collect::<Vec<_>>());
    }

    #[test]
    fn derive_seed_depends_on_order() {
        assert_eq!(derive_seed(&[1, 2, 3]), derive_seed(&[1, 2, 3]));
        assert_ne!(derive_seed(&[1, 2, 3]), derive_seed(&[3, 2, 1]));
        assert_ne!(derive_seed(&[]), derive_seed(&[0]));
    }

    #[test]
    fn serialization_roundtrip_continues_stream() {
        let mut rng = GameRng::new(42);
        for _ in 0..100 {
            rng.next_u64();
        }
        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: GameRng = serde_json::from_str(&json).unwrap();
        for _ in 0..100 {
            assert_eq!(rng.next_u64(), restored.next_u64());
        }
    }

    proptest! {
        #[test]
        fn range_usize_never_escapes(seed in any::<u64>(), low in 0usize..1000, width in 1usize..1000) {
            let mut rng = GameRng::new(seed);
            let v = rng.range_usize(low, low + width);
            prop_assert!(v >= low && v < low + width);
        }

        #[test]
        fn derive_seed_is_pure(contributions in proptest::collection::vec(any::<u64>(), 0..8)) {
            prop_assert_eq!(derive_seed(&contributions), derive_seed(&contributions));
        }
    }
}
