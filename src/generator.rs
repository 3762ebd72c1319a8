//! Synthetic data stream with injected spikes.
//!
//! Gaussian noise around a base level, an optional linear drift, and a small
//! chance per sample of a large spike in either direction. Seeded, so a run
//! can be replayed exactly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::detector::Observation;
use crate::error::GeneratorError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub base: f64,
    pub noise_std: f64,
    /// Added to the base level after every sample.
    pub drift_per_step: f64,
    pub spike_probability: f64,
    pub spike_min: f64,
    pub spike_max: f64,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base: 100.0,
            noise_std: 10.0,
            drift_per_step: 0.0,
            spike_probability: 0.05,
            spike_min: 50.0,
            spike_max: 100.0,
            seed: 42,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), GeneratorError> {
        let invalid = |name: &'static str, reason: String| GeneratorError::InvalidParameter { name, reason };

        if !self.base.is_finite() {
            return Err(invalid("base", format!("must be finite, got {}", self.base)));
        }
        if !(self.noise_std.is_finite() && self.noise_std >= 0.0) {
            return Err(invalid(
                "noise_std",
                format!("must be finite and non-negative, got {}", self.noise_std),
            ));
        }
        if !self.drift_per_step.is_finite() {
            return Err(invalid(
                "drift_per_step",
                format!("must be finite, got {}", self.drift_per_step),
            ));
        }
        if !(0.0..=1.0).contains(&self.spike_probability) {
            return Err(invalid(
                "spike_probability",
                format!("must be in [0, 1], got {}", self.spike_probability),
            ));
        }
        if !(self.spike_min.is_finite() && self.spike_max.is_finite() && self.spike_min < self.spike_max) {
            return Err(invalid(
                "spike_min",
                format!(
                    "spike range [{}, {}) must be finite and non-empty",
                    self.spike_min, self.spike_max
                ),
            ));
        }
        Ok(())
    }
}

/// A generated sample plus ground truth.
#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
pub struct GeneratedSample {
    pub observation: Observation,
    pub is_injected_spike: bool,
}

/// Infinite, deterministic sample source.
pub struct StreamGenerator {
    config: GeneratorConfig,
    rng: StdRng,
    noise: Normal<f64>,
    level: f64,
    index: u64,
}

impl StreamGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, GeneratorError> {
        config.validate()?;
        let noise = Normal::new(0.0, config.noise_std).map_err(|e| GeneratorError::InvalidParameter {
            name: "noise_std",
            reason: e.to_string(),
        })?;
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            level: config.base,
            index: 0,
            noise,
            config,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn next_sample(&mut self) -> GeneratedSample {
        let mut value = self.level + self.noise.sample(&mut self.rng);

        let is_injected_spike = self.rng.random_bool(self.config.spike_probability);
        if is_injected_spike {
            let sign = if self.rng.random_bool(0.5) { 1.0 } else { -1.0 };
            value += sign * self.rng.random_range(self.config.spike_min..self.config.spike_max);
        }

        let observation = Observation::at(self.index, value);
        self.index += 1;
        self.level += self.config.drift_per_step;

        GeneratedSample {
            observation,
            is_injected_spike,
        }
    }
}

impl Iterator for StreamGenerator {
    type Item = GeneratedSample;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_sample())
    }
}
