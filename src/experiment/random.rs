//! Uniform draws on the traffic scale, injectable for deterministic tests

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::constants::TRAFFIC_SCALE;

pub trait RandomSource: Send + Sync {
    /// Uniform draw in [0, 100)
    fn next_percent(&self) -> f64;
}

/// Thread-local RNG, the production default
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_percent(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..TRAFFIC_SCALE)
    }
}

/// Reproducible sequence from a fixed seed
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_percent(&self) -> f64 {
        self.rng.lock().gen_range(0.0..TRAFFIC_SCALE)
    }
}

/// Always returns the same draw
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_percent(&self) -> f64 {
        self.0
    }
}
