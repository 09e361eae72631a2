use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::errors::ForestError;

pub type Result<T> = std::result::Result<T, ForestError>;

/// Index vended by a [`PointStore`](crate::pointstore::PointStore) to
/// reference a stored vector. Stable across compactions; only the backing
/// offset behind it moves.
pub type PointHandle = usize;

/// Per-forest monotone sequence index assigned by the executor.
pub type SequenceIndex = u64;

/// Randomness capability consumed by the tree and stochastic visitors:
/// uniform draws in `[0, 1)`. The core never touches a global RNG; production
/// code wires in [`SeededRandom`], tests may script the exact sequence with
/// [`ScriptedRandom`]. Draws require `&mut`; the bounds only let the owning
/// tree cross the executor's thread pool.
pub trait RandomUnit: Send + Sync {
    fn next_unit(&mut self) -> f64;
}

/// ChaCha20-backed production source.
pub struct SeededRandom {
    rng: ChaCha20Rng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        SeededRandom {
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }
}

impl RandomUnit for SeededRandom {
    fn next_unit(&mut self) -> f64 {
        self.rng.gen()
    }
}

/// Replays a fixed sequence of draws, then falls back to a seeded stream.
/// Exists for deterministic shape tests; panics are acceptable there.
pub struct ScriptedRandom {
    script: Vec<f64>,
    position: usize,
    fallback: ChaCha20Rng,
}

impl ScriptedRandom {
    pub fn new(script: &[f64]) -> Self {
        ScriptedRandom {
            script: script.to_vec(),
            position: 0,
            fallback: ChaCha20Rng::seed_from_u64(0),
        }
    }
}

impl RandomUnit for ScriptedRandom {
    fn next_unit(&mut self) -> f64 {
        if self.position < self.script.len() {
            let value = self.script[self.position];
            self.position += 1;
            value
        } else {
            self.fallback.gen()
        }
    }
}
