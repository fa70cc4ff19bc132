//! Batch seed scheduling and the per-trial random streams.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::error_log::Seed;

/// Hands out a shuffled identity range of trial seeds for one batch.
///
/// The scheduler keeps its RNG across calls, so two schedules drawn from the
/// same scheduler differ while two schedulers built from the same batch seed
/// agree.
#[derive(Debug, Clone)]
pub struct SeedScheduler {
    rng: StdRng,
}

impl SeedScheduler {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }

    /// Seeds the batch RNG from `batch_seed`, or from entropy when none is
    /// configured. The seed actually used is logged so a batch can be replayed.
    pub fn from_batch_seed(batch_seed: Option<u64>) -> Self {
        let seed = batch_seed.unwrap_or_else(|| rand::thread_rng().next_u64());
        info!(batch_seed = seed, "seed scheduler initialised");
        Self::new(StdRng::seed_from_u64(seed))
    }

    /// A permutation of `0..total_trials`.
    pub fn schedule(&mut self, total_trials: usize) -> Vec<Seed> {
        let mut seeds: Vec<Seed> = (0..total_trials as Seed).collect();
        seeds.shuffle(&mut self.rng);
        seeds
    }
}

/// The three randomness streams owned by a single trial.
///
/// All three are derived from the trial seed in one constructor; nothing
/// samples before the bundle exists, so a trial can never observe a partially
/// reseeded state.
#[derive(Debug, Clone)]
pub struct TrialRngs {
    pub seed: Seed,
    /// General-purpose stream for collaborators outside the array math.
    pub general: StdRng,
    /// Elementwise perturbation and synthetic field draws.
    pub array: ChaCha8Rng,
    /// Handed to the forecast model.
    pub model: ChaCha8Rng,
}

impl TrialRngs {
    const ARRAY_STREAM: u64 = 0;
    const MODEL_STREAM: u64 = 1;

    pub fn from_seed(seed: Seed) -> Self {
        let mut array = ChaCha8Rng::seed_from_u64(seed);
        array.set_stream(Self::ARRAY_STREAM);
        let mut model = ChaCha8Rng::seed_from_u64(seed);
        model.set_stream(Self::MODEL_STREAM);

        Self {
            seed,
            general: StdRng::seed_from_u64(seed),
            array,
            model,
        }
    }
}
