//! Process-wide randomness for greetings and coin flips.
//!
//! One generator is seeded from OS entropy at startup and shared behind a
//! mutex; it is never reseeded.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Greetings picked by `!greet` and "hi golly".
pub const GREETINGS: &[&str] = &[
    "Hey",
    "It's good to see you again",
    "What's up?",
    "It's a pleasure to meet you",
];

/// The two faces of the coin.
pub const COIN: [&str; 2] = ["heads", "tails"];

/// Thread-safe wrapper around a single seeded generator.
#[derive(Debug)]
pub struct Randomizer {
    rng: Mutex<StdRng>,
}

impl Randomizer {
    /// Seed from OS entropy.
    pub fn from_entropy() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Fixed seed, for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Uniformly pick one element, or `None` for an empty slice.
    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        items.choose(&mut *rng)
    }

    /// Uniform index in `0..n`. `n` must be non-zero.
    pub fn index(&self, n: usize) -> usize {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(0..n)
    }
}

/// "<greeting>, <mention>"
pub fn greeting(rng: &Randomizer, mention: &str) -> String {
    let hello = rng.pick(GREETINGS).copied().unwrap_or(GREETINGS[0]);
    format!("{}, {}", hello, mention)
}

/// "Flipped the coin and you get : heads|tails"
pub fn coin_flip(rng: &Randomizer) -> String {
    let side = COIN[rng.index(COIN.len())];
    format!("Flipped the coin and you get : {}", side)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
