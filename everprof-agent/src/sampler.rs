use rand::rngs::SmallRng;
use rand::{RngExt, SeedableRng};

/// Draws exponentially distributed inter-sample byte intervals with mean
/// equal to the configured interval, so that sampling is a Poisson process
/// over allocated bytes. A deterministic mode replaces the distribution with
/// the fixed interval for tests.
pub struct AllocationSampler {
    interval: u64,
    deterministic: bool,
    rng: SmallRng,
}

impl AllocationSampler {
    pub fn new(interval: u64, deterministic: bool) -> Self {
        AllocationSampler {
            interval: interval.max(1),
            deterministic,
            rng: rand::make_rng(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(interval: u64, deterministic: bool, seed: u64) -> Self {
        AllocationSampler {
            interval: interval.max(1),
            deterministic,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// The byte distance to the next sample boundary.
    pub fn next_sample_interval(&mut self) -> i64 {
        if self.deterministic {
            return self.interval as i64;
        }
        let u: f64 = self.rng.random();
        let value = -(1.0 - u).ln() * self.interval as f64;
        (value as i64).max(1)
    }

    /// Cross every sample boundary covered by `remaining` (which must be
    /// non-negative and already include the triggering allocation's size).
    /// Returns the bytes to report against the current stack and the new,
    /// negative remaining budget.
    pub fn cross_boundaries(&mut self, mut remaining: i64) -> (u64, i64) {
        debug_assert!(remaining >= 0);
        let interval = self.interval as i64;
        let mut nsamples = remaining / interval;
        remaining %= interval;
        loop {
            remaining -= self.next_sample_interval();
            nsamples += 1;
            if remaining < 0 {
                break;
            }
        }
        (nsamples as u64 * self.interval, remaining)
    }
}
