//! Frugal streaming quantile estimation.
//!
//! Keeps a single running estimate of the target percentile of a stream and
//! nudges it by a fixed step per sample: up when the sample is above the
//! estimate (with probability `q`), down when it is below (with probability
//! `1 - q`). The estimate settles where `P(sample < estimate) == q`, uses O(1)
//! time and space, and follows a drifting stream. It is approximate: expect
//! jitter of a few steps around the true quantile.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
pub struct FrugalQuantileEstimator {
    percentile: u32,
    step: f64,
    estimation: f64,
    rng: StdRng,
}

impl FrugalQuantileEstimator {
    /// Estimator for `percentile` (0..=100) moving by `step` per sample
    pub fn new(percentile: u32, step: f64, initial_estimation: f64) -> Self {
        Self::with_rng(
            percentile,
            step,
            initial_estimation,
            StdRng::from_entropy(),
        )
    }

    /// Deterministic estimator, for reproducible runs
    pub fn with_seed(percentile: u32, step: f64, initial_estimation: f64, seed: u64) -> Self {
        Self::with_rng(
            percentile,
            step,
            initial_estimation,
            StdRng::seed_from_u64(seed),
        )
    }

    fn with_rng(percentile: u32, step: f64, initial_estimation: f64, rng: StdRng) -> Self {
        assert!(
            percentile <= 100,
            "percentile(={percentile}) must be in [0, 100]"
        );
        assert!(step > 0.0, "step(={step}) must be > 0");
        Self {
            percentile,
            step,
            estimation: initial_estimation,
            rng,
        }
    }

    /// Feed one sample, returning the updated estimate
    ///
    /// Takes `&mut self`: the estimator has a single mutator (the housekeeper).
    pub fn update_estimation(&mut self, sample: f64) -> f64 {
        let q = self.percentile as f64 / 100.0;
        let r: f64 = self.rng.gen();
        if sample > self.estimation && r > 1.0 - q {
            self.estimation += self.step;
        } else if sample < self.estimation && r > q {
            self.estimation -= self.step;
        }
        self.estimation
    }

    pub fn current_estimation(&self) -> f64 {
        self.estimation
    }

    pub fn percentile_to_estimate(&self) -> u32 {
        self.percentile
    }

    /// Retarget the estimator; the current estimate is kept and drifts from there
    pub fn update_target_percentile(&mut self, percentile: u32) {
        assert!(
            percentile <= 100,
            "percentile(={percentile}) must be in [0, 100]"
        );
        self.percentile = percentile;
    }
}
