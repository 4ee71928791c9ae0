//! Random delay sources for the per-origin dispatcher.
//!
//! Every source returns a duration in the half-open range `[0, interval)`;
//! a zero interval always yields zero.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Produces uniformly distributed delays.
pub trait RandomSource {
    /// A delay in `[0, interval)`.
    fn delay_within(&mut self, interval: Duration) -> Duration;
}

fn sample<R: Rng + ?Sized>(rng: &mut R, interval: Duration) -> Duration {
    let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.random_range(0..nanos))
}

/// Thread-local OS-seeded generator. The production default.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSource;

impl RandomSource for ThreadRngSource {
    fn delay_within(&mut self, interval: Duration) -> Duration {
        sample(&mut rand::rng(), interval)
    }
}

/// Reproducible generator for simulations and property tests.
#[derive(Debug, Clone)]
pub struct SeededSource {
    rng: StdRng,
}

impl SeededSource {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for SeededSource {
    fn delay_within(&mut self, interval: Duration) -> Duration {
        sample(&mut self.rng, interval)
    }
}

/// Hands out a fixed script of delays, in order.
///
/// Values at or above the interval are pulled just below it so the
/// half-open contract holds; once the script runs out every draw is zero.
#[derive(Debug, Default, Clone)]
pub struct ScriptedDelays {
    script: VecDeque<Duration>,
}

impl ScriptedDelays {
    #[must_use]
    pub fn new(script: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }

    /// Draws left in the script.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl RandomSource for ScriptedDelays {
    fn delay_within(&mut self, interval: Duration) -> Duration {
        let next = self.script.pop_front().unwrap_or(Duration::ZERO);
        if interval.is_zero() {
            return Duration::ZERO;
        }
        next.min(interval - Duration::from_nanos(1))
    }
}
