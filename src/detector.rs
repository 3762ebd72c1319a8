//! Streaming EWMA anomaly detector with a dynamic threshold.
//!
//! The detector keeps a running mean and a running spread estimate, both
//! exponentially weighted, and flags a sample when its distance from the
//! prior mean exceeds `k` spread units. State is a handful of scalars no
//! matter how long the stream runs.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::algo::ewma::{DeviationEstimator, DeviationTracker, Ewma};
use crate::error::{DetectorError, Result};

pub const DEFAULT_ALPHA: f64 = 0.2;
pub const DEFAULT_THRESHOLD_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_WARMUP_COUNT: u32 = 30;

/// Construction-time parameters. Validated once, never re-read.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Smoothing factor in `(0, 1]`. Higher = more responsive.
    pub alpha: f64,
    /// Threshold multiplier: spread units a sample may stray before it is flagged.
    pub k: f64,
    /// Samples consumed for calibration before any verdict can be anomalous.
    pub warmup_count: u32,
    pub estimator: DeviationEstimator,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_THRESHOLD_MULTIPLIER,
            warmup_count: DEFAULT_WARMUP_COUNT,
            estimator: DeviationEstimator::default(),
        }
    }
}

impl DetectorConfig {
    pub fn new(alpha: f64, k: f64, warmup_count: u32) -> Self {
        Self {
            alpha,
            k,
            warmup_count,
            estimator: DeviationEstimator::default(),
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set `alpha` so that a sample's weight halves every `half_life` samples.
    pub fn with_half_life(mut self, half_life: f64) -> Self {
        self.alpha = Ewma::from_half_life(half_life).alpha();
        self
    }

    pub fn with_k(mut self, k: f64) -> Self {
        self.k = k;
        self
    }

    pub fn with_warmup(mut self, warmup_count: u32) -> Self {
        self.warmup_count = warmup_count;
        self
    }

    pub fn with_estimator(mut self, estimator: DeviationEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn validate(&self) -> Result<()> {
        // Written as negated comparisons so NaN fails too.
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(DetectorError::invalid_config(
                "alpha",
                format!("must be in (0, 1], got {}", self.alpha),
            ));
        }
        if !(self.k > 0.0 && self.k.is_finite()) {
            return Err(DetectorError::invalid_config(
                "k",
                format!("must be positive and finite, got {}", self.k),
            ));
        }
        if self.warmup_count == 0 {
            return Err(DetectorError::invalid_config(
                "warmup_count",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// False when the threshold always outgrows the residual that widened it.
    pub fn can_flag(&self) -> bool {
        self.estimator.can_flag(self.alpha, self.k)
    }
}

/// Calibration phase of a detector.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Seeding estimates; every verdict is non-anomalous.
    Warming,
    /// Threshold applied.
    Steady,
}

/// A single sample as delivered by a source.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Observation {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            timestamp: None,
        }
    }

    pub fn at(timestamp: u64, value: f64) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }
}

impl From<f64> for Observation {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

/// Per-sample outcome of [`StreamAnomalyDetector::observe`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Verdict {
    pub is_anomaly: bool,
    /// Mean after incorporating the sample.
    pub mean: f64,
    /// `k` times the spread after incorporating the sample.
    pub threshold: f64,
    /// Raw distance of the sample from the mean it was judged against.
    pub deviation: f64,
    /// Phase the sample was judged in.
    pub phase: Phase,
}

impl Verdict {
    /// Ratio of the observed deviation to the threshold (>1 means outside the band).
    pub fn score(&self) -> f64 {
        if self.threshold <= 0.0 {
            return 0.0;
        }
        self.deviation / self.threshold
    }
}

/// Externally persistable detector state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DetectorSnapshot {
    pub config: DetectorConfig,
    pub mean: Option<f64>,
    pub deviation: Option<f64>,
    pub sample_count: u64,
}

/// Constant-memory EWMA anomaly detector for a single stream.
///
/// Not internally synchronized: one instance per stream, or external locking.
#[derive(Clone, Debug)]
pub struct StreamAnomalyDetector {
    config: DetectorConfig,
    mean: Ewma,
    spread: DeviationTracker,
    sample_count: u64,
}

impl StreamAnomalyDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        if !config.can_flag() {
            warn!(
                alpha = config.alpha,
                k = config.k,
                estimator = ?config.estimator,
                "Detector configuration can never flag an anomaly"
            );
        }
        Ok(Self::unchecked(config))
    }

    pub fn with_defaults() -> Self {
        Self::unchecked(DetectorConfig::default())
    }

    /// Empty detector for an already validated config.
    fn unchecked(config: DetectorConfig) -> Self {
        Self {
            config,
            mean: Ewma::new(config.alpha),
            spread: DeviationTracker::new(config.estimator, config.alpha),
            sample_count: 0,
        }
    }

    /// Rebuild a detector from a snapshot taken by [`snapshot`](Self::snapshot).
    pub fn restore(snapshot: DetectorSnapshot) -> Result<Self> {
        let DetectorSnapshot {
            config,
            mean,
            deviation,
            sample_count,
        } = snapshot;

        config.validate()?;

        match (mean, sample_count) {
            (None, 0) => {}
            (Some(m), n) if n > 0 => {
                if !m.is_finite() {
                    return Err(DetectorError::InvalidSnapshot(format!(
                        "mean must be finite, got {}",
                        m
                    )));
                }
            }
            (None, n) => {
                return Err(DetectorError::InvalidSnapshot(format!(
                    "mean missing with sample_count {}",
                    n
                )));
            }
            (Some(_), _) => {
                return Err(DetectorError::InvalidSnapshot(
                    "mean present with sample_count 0".to_string(),
                ));
            }
        }

        let deviation = deviation.unwrap_or(0.0);
        if !(deviation.is_finite() && deviation >= 0.0) {
            return Err(DetectorError::InvalidSnapshot(format!(
                "deviation must be finite and non-negative, got {}",
                deviation
            )));
        }

        Ok(Self {
            config,
            mean: Ewma::seeded(config.alpha, mean),
            spread: DeviationTracker::from_deviation(config.estimator, config.alpha, deviation),
            sample_count,
        })
    }

    pub fn snapshot(&self) -> DetectorSnapshot {
        DetectorSnapshot {
            config: self.config,
            mean: self.mean(),
            deviation: self.deviation(),
            sample_count: self.sample_count,
        }
    }

    /// Incorporate one sample and classify it.
    ///
    /// Non-finite input is rejected and leaves the state untouched.
    pub fn observe(&mut self, value: f64) -> Result<Verdict> {
        if !value.is_finite() {
            return Err(DetectorError::NonFiniteInput { value });
        }

        let phase = self.phase();

        let Some(prior_mean) = self.mean.value() else {
            self.mean.update(value);
            self.spread.reset();
            self.sample_count += 1;
            self.log_transition(phase);
            return Ok(Verdict {
                is_anomaly: false,
                mean: value,
                threshold: 0.0,
                deviation: 0.0,
                phase,
            });
        };

        let residual = (value - prior_mean).abs();

        // Compute both updates before committing either; an overflow to
        // infinity would otherwise leave the pair half-applied.
        let mean = self.mean.peek(value);
        let spread = self.spread.peek(residual);
        if !(mean.is_finite() && spread.is_finite()) {
            return Err(DetectorError::NonFiniteInput { value });
        }
        self.mean.update(value);
        self.spread.update(residual);

        let threshold = self.config.k * spread;
        let is_anomaly = match phase {
            Phase::Warming => false,
            Phase::Steady => residual > threshold,
        };
        self.sample_count += 1;
        self.log_transition(phase);

        Ok(Verdict {
            is_anomaly,
            mean,
            threshold,
            deviation: residual,
            phase,
        })
    }

    pub fn observe_at(&mut self, observation: Observation) -> Result<Verdict> {
        self.observe(observation.value)
    }

    /// Return to the freshly constructed state, keeping the configuration.
    pub fn reset(&mut self) {
        self.mean.reset();
        self.spread.reset();
        self.sample_count = 0;
    }

    pub fn phase(&self) -> Phase {
        let warmup = u64::from(self.config.warmup_count);
        if warmup > 1 && self.sample_count < warmup {
            Phase::Warming
        } else {
            Phase::Steady
        }
    }

    pub fn mean(&self) -> Option<f64> {
        self.mean.value()
    }

    /// Current spread estimate; `None` until the first sample.
    pub fn deviation(&self) -> Option<f64> {
        self.mean.value().map(|_| self.spread.value())
    }

    pub fn threshold(&self) -> Option<f64> {
        self.deviation().map(|d| self.config.k * d)
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn log_transition(&self, before: Phase) {
        if before == Phase::Warming && self.phase() == Phase::Steady {
            debug!(
                samples = self.sample_count,
                mean = self.mean.value(),
                deviation = self.spread.value(),
                "Warm-up complete"
            );
        }
    }
}

impl Default for StreamAnomalyDetector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(alpha: f64, k: f64, warmup: u32) -> StreamAnomalyDetector {
        StreamAnomalyDetector::new(DetectorConfig::new(alpha, k, warmup)).unwrap()
    }

    #[test]
    fn test_first_sample_seeds_state() {
        let mut d = detector(0.3, 3.0, 1);
        assert_eq!(d.mean(), None);
        assert_eq!(d.deviation(), None);

        let verdict = d.observe(42.0).unwrap();
        assert!(!verdict.is_anomaly);
        assert_eq!(verdict.mean, 42.0);
        assert_eq!(verdict.threshold, 0.0);
        assert_eq!(d.mean(), Some(42.0));
        assert_eq!(d.deviation(), Some(0.0));
        assert_eq!(d.sample_count(), 1);
    }

    #[test]
    fn test_update_rule() {
        let mut d = detector(0.5, 2.0, 1);
        d.observe(10.0).unwrap();
        let verdict = d.observe(14.0).unwrap();

        assert_eq!(verdict.deviation, 4.0);
        assert_eq!(verdict.mean, 12.0);
        // spread = 0.5 * 4 + 0.5 * 0 = 2, threshold = 2 * 2
        assert_eq!(d.deviation(), Some(2.0));
        assert_eq!(verdict.threshold, 4.0);
        assert!(!verdict.is_anomaly, "residual equal to threshold is not anomalous");
    }

    #[test]
    fn test_spike_detected_after_warmup() {
        let mut d = detector(0.3, 3.0, 5);
        for v in [20.0, 21.0, 20.0, 22.0, 21.0] {
            let verdict = d.observe(v).unwrap();
            assert!(!verdict.is_anomaly);
            assert_eq!(verdict.phase, Phase::Warming);
        }
        assert_eq!(d.phase(), Phase::Steady);

        let verdict = d.observe(50.0).unwrap();
        assert!(verdict.is_anomaly, "spike should be flagged: {:?}", verdict);
        assert_eq!(verdict.phase, Phase::Steady);
        assert!(verdict.score() > 1.0);
    }

    #[test]
    fn test_warmup_one_is_immediately_steady() {
        let d = detector(0.5, 1.0, 1);
        assert_eq!(d.phase(), Phase::Steady);

        let d = detector(0.5, 1.0, 3);
        assert_eq!(d.phase(), Phase::Warming);
    }

    #[test]
    fn test_non_finite_input_is_atomic() {
        let mut d = detector(0.3, 3.0, 2);
        d.observe(1.0).unwrap();
        d.observe(2.0).unwrap();
        let before = d.snapshot();

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = d.observe(bad).unwrap_err();
            assert!(matches!(err, DetectorError::NonFiniteInput { .. }));
            assert_eq!(d.snapshot(), before);
        }
    }

    #[test]
    fn test_overflowing_input_is_atomic() {
        let mut d = detector(0.5, 1.0, 1);
        d.observe(-f64::MAX).unwrap();
        let before = d.snapshot();

        assert!(d.observe(f64::MAX).is_err());
        assert_eq!(d.snapshot(), before);
    }

    #[test]
    fn test_config_validation() {
        for config in [
            DetectorConfig::new(0.0, 1.0, 1),
            DetectorConfig::new(1.5, 1.0, 1),
            DetectorConfig::new(f64::NAN, 1.0, 1),
            DetectorConfig::new(0.5, -1.0, 1),
            DetectorConfig::new(0.5, 0.0, 1),
            DetectorConfig::new(0.5, f64::INFINITY, 1),
            DetectorConfig::new(0.5, 1.0, 0),
        ] {
            let err = StreamAnomalyDetector::new(config).unwrap_err();
            assert!(
                matches!(err, DetectorError::InvalidConfiguration { .. }),
                "{:?} should be rejected",
                config
            );
        }

        assert!(StreamAnomalyDetector::new(DetectorConfig::new(1.0, 1.0, 1)).is_ok());
    }

    #[test]
    fn test_can_flag() {
        assert!(DetectorConfig::new(0.3, 3.0, 1).can_flag());
        assert!(!DetectorConfig::new(1.0, 1.0, 1).can_flag());

        // alpha = 1, k = 1: the threshold always equals the residual.
        let mut d = detector(1.0, 1.0, 1);
        d.observe(0.0).unwrap();
        assert!(!d.observe(1_000.0).unwrap().is_anomaly);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.can_flag());
        assert_eq!(StreamAnomalyDetector::default().config(), &config);
    }

    #[test]
    fn test_with_defaults_matches_new() {
        let mut a = StreamAnomalyDetector::with_defaults();
        let mut b = StreamAnomalyDetector::new(DetectorConfig::default()).unwrap();
        assert_eq!(a.snapshot(), b.snapshot());
        for v in [3.0, 4.0, 9.0, 3.5] {
            assert_eq!(a.observe(v).unwrap(), b.observe(v).unwrap());
        }
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_half_life() {
        let config = DetectorConfig::default().with_half_life(1.0);
        assert!((config.alpha - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_std_dev_estimator() {
        let mut d = StreamAnomalyDetector::new(
            DetectorConfig::new(0.1, 2.0, 3).with_estimator(DeviationEstimator::StdDev),
        )
        .unwrap();
        for v in [10.0, 11.0, 9.0, 10.0, 10.5, 9.5] {
            assert!(!d.observe(v).unwrap().is_anomaly);
        }
        assert!(d.observe(30.0).unwrap().is_anomaly);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut original = detector(0.3, 3.0, 5);
        for v in [20.0, 21.0, 20.0, 22.0, 21.0, 20.5] {
            original.observe(v).unwrap();
        }

        let json = serde_json::to_value(original.snapshot()).unwrap();
        assert_eq!(json["sample_count"], 6);
        assert_eq!(json["config"]["estimator"], "absolute_deviation");

        let mut restored = StreamAnomalyDetector::restore(original.snapshot()).unwrap();

        assert_eq!(restored.sample_count(), original.sample_count());
        assert_eq!(restored.phase(), Phase::Steady);
        for v in [21.0, 50.0, 20.0] {
            assert_eq!(restored.observe(v).unwrap(), original.observe(v).unwrap());
        }
    }

    #[test]
    fn test_restore_rejects_inconsistent_state() {
        let config = DetectorConfig::new(0.3, 3.0, 5);
        let cases = [
            DetectorSnapshot {
                config,
                mean: None,
                deviation: None,
                sample_count: 3,
            },
            DetectorSnapshot {
                config,
                mean: Some(1.0),
                deviation: Some(0.0),
                sample_count: 0,
            },
            DetectorSnapshot {
                config,
                mean: Some(1.0),
                deviation: Some(-1.0),
                sample_count: 2,
            },
            DetectorSnapshot {
                config,
                mean: Some(f64::NAN),
                deviation: Some(0.0),
                sample_count: 2,
            },
        ];
        for snapshot in cases {
            assert!(matches!(
                StreamAnomalyDetector::restore(snapshot),
                Err(DetectorError::InvalidSnapshot(_))
            ));
        }

        let bad_config = DetectorSnapshot {
            config: DetectorConfig::new(2.0, 3.0, 5),
            mean: None,
            deviation: None,
            sample_count: 0,
        };
        assert!(matches!(
            StreamAnomalyDetector::restore(bad_config),
            Err(DetectorError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_reset() {
        let mut d = detector(0.3, 3.0, 5);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0] {
            d.observe(v).unwrap();
        }
        d.reset();
        assert_eq!(d.sample_count(), 0);
        assert_eq!(d.mean(), None);
        assert_eq!(d.phase(), Phase::Warming);
    }

    #[test]
    fn test_observe_at_ignores_timestamp() {
        let mut a = detector(0.3, 3.0, 1);
        let mut b = detector(0.3, 3.0, 1);
        for (i, v) in [5.0, 6.0, 30.0].into_iter().enumerate() {
            assert_eq!(
                a.observe_at(Observation::at(i as u64 * 1_000, v)).unwrap(),
                b.observe_at(v.into()).unwrap()
            );
        }
    }
}
