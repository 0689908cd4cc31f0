//! Geometric backoff with normally distributed jitter.
//!
//! # Responsibilities
//! - Produce the per-round mean delays of a dial retry schedule
//! - Draw the actual sleep for a round around its mean
//!
//! # Design Decisions
//! - Means start at `initial_mean` and grow by `factor` while `<= final_mean`
//! - Jitter is a normal draw with standard deviation `jitter * mean`, so
//!   concurrent dialers do not retry in lockstep
//! - Constants live in configuration, not in code
//! - Inputs are clamped on construction so `means` never panics: means
//!   stay within `0..=MAX_MEAN_SECS`, a non-finite initial mean is zero and
//!   a non-finite factor gives a single round

use std::time::Duration;

use rand_distr::{Distribution, Normal};

use crate::config::BackoffConfig;

/// Upper bound on rounds, guarding against degenerate configurations.
const MAX_ROUNDS: usize = 64;

/// Largest mean a round may have.
const MAX_MEAN_SECS: f64 = 3600.0;

fn clamp_secs(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, MAX_MEAN_SECS)
    } else if value == f64::INFINITY {
        MAX_MEAN_SECS
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial_mean: f64,
    final_mean: f64,
    factor: f64,
    jitter: f64,
}

impl BackoffPolicy {
    /// Build a policy from means expressed in seconds.
    pub fn new(initial_mean: f64, final_mean: f64, factor: f64, jitter: f64) -> Self {
        let initial_mean = if initial_mean.is_finite() { clamp_secs(initial_mean) } else { 0.0 };
        Self {
            initial_mean,
            final_mean: clamp_secs(final_mean),
            factor: if factor.is_finite() { factor } else { 1.0 },
            jitter: if jitter.is_finite() { jitter.max(0.0) } else { 0.0 },
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            config.initial_mean_secs,
            config.final_mean_secs,
            config.factor,
            config.jitter,
        )
    }

    /// A policy that tries exactly once and never sleeps.
    pub fn single_round() -> Self {
        Self::new(0.0, 0.0, 2.0, 0.0)
    }

    /// Mean delay of every round, in order.
    pub fn means(&self) -> Vec<Duration> {
        let mut means = Vec::new();
        if self.initial_mean <= 0.0 || self.factor <= 1.0 {
            means.push(Duration::from_secs_f64(self.initial_mean.max(0.0)));
            return means;
        }
        // Tolerate float drift when final_mean is an exact multiple.
        let limit = self.final_mean * (1.0 + 1e-9);
        let mut mean = self.initial_mean;
        while mean <= limit && mean <= MAX_MEAN_SECS && means.len() < MAX_ROUNDS {
            means.push(Duration::from_secs_f64(mean));
            mean *= self.factor;
        }
        if means.is_empty() {
            means.push(Duration::from_secs_f64(self.initial_mean));
        }
        means
    }

    pub fn rounds(&self) -> usize {
        self.means().len()
    }

    /// Sum of every round's mean delay.
    pub fn worst_case(&self) -> Duration {
        self.means().into_iter().sum()
    }

    /// Draw the sleep for a round whose mean is `mean`.
    pub fn jittered(&self, mean: Duration) -> Duration {
        let mean = mean.as_secs_f64();
        if mean <= 0.0 {
            return Duration::ZERO;
        }
        let stdev = self.jitter * mean;
        if stdev == 0.0 {
            return Duration::from_secs_f64(mean);
        }
        let seconds = match Normal::new(mean, stdev) {
            Ok(normal) => normal.sample(&mut rand::thread_rng()),
            Err(_) => mean,
        };
        Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
