use serde::{Deserialize, Serialize};

/// Scalar exponentially weighted moving average.
///
/// Seeded by the first sample; every later sample is blended in as
/// `alpha * sample + (1 - alpha) * value`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Smoothing factor that halves a sample's weight after `half_life` updates.
    pub fn from_half_life(half_life: f64) -> Self {
        Self::new(1.0 - (-std::f64::consts::LN_2 / half_life).exp())
    }

    pub(crate) fn seeded(alpha: f64, value: Option<f64>) -> Self {
        Self { alpha, value }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    /// Value the next update would produce, without committing it.
    pub fn peek(&self, sample: f64) -> f64 {
        match self.value {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// How the spread around the running mean is estimated.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviationEstimator {
    /// EWMA of `|x - mean|`
    #[default]
    AbsoluteDeviation,
    /// Square root of the EWMA of `(x - mean)^2`
    StdDev,
}

impl DeviationEstimator {
    /// Whether `k` spread units can ever be exceeded by a sample whose own
    /// residual is already folded into the spread estimate.
    ///
    /// With the residual `d` included, the absolute estimator reports at
    /// least `alpha * d` and the squared one at least `sqrt(alpha) * d`.
    pub fn can_flag(self, alpha: f64, k: f64) -> bool {
        match self {
            DeviationEstimator::AbsoluteDeviation => k * alpha < 1.0,
            DeviationEstimator::StdDev => k * k * alpha < 1.0,
        }
    }
}

/// Running spread estimate fed with residuals from the prior mean.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviationTracker {
    estimator: DeviationEstimator,
    alpha: f64,
    // AbsoluteDeviation: mean absolute residual. StdDev: mean squared residual.
    accumulator: f64,
}

impl DeviationTracker {
    pub fn new(estimator: DeviationEstimator, alpha: f64) -> Self {
        Self {
            estimator,
            alpha,
            accumulator: 0.0,
        }
    }

    /// Rebuild a tracker from a previously reported [`value`](Self::value).
    pub(crate) fn from_deviation(estimator: DeviationEstimator, alpha: f64, deviation: f64) -> Self {
        let accumulator = match estimator {
            DeviationEstimator::AbsoluteDeviation => deviation,
            DeviationEstimator::StdDev => deviation * deviation,
        };
        Self {
            estimator,
            alpha,
            accumulator,
        }
    }

    /// Fold in the residual `residual` and return the new spread.
    pub fn update(&mut self, residual: f64) -> f64 {
        self.accumulator = self.peek_accumulator(residual);
        self.value()
    }

    /// Spread the next update would produce, without committing it.
    pub fn peek(&self, residual: f64) -> f64 {
        self.spread_of(self.peek_accumulator(residual))
    }

    pub fn value(&self) -> f64 {
        self.spread_of(self.accumulator)
    }

    pub fn estimator(&self) -> DeviationEstimator {
        self.estimator
    }

    pub fn reset(&mut self) {
        self.accumulator = 0.0;
    }

    fn peek_accumulator(&self, residual: f64) -> f64 {
        let d = residual.abs();
        let term = match self.estimator {
            DeviationEstimator::AbsoluteDeviation => d,
            DeviationEstimator::StdDev => d * d,
        };
        self.alpha * term + (1.0 - self.alpha) * self.accumulator
    }

    fn spread_of(&self, accumulator: f64) -> f64 {
        match self.estimator {
            DeviationEstimator::AbsoluteDeviation => accumulator,
            DeviationEstimator::StdDev => accumulator.sqrt(),
        }
    }
}
