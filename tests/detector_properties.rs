use ewma_stream::{
    DetectorConfig, DetectorError, DeviationEstimator, Phase, StreamAnomalyDetector, Verdict,
};
use proptest::prelude::*;

fn detector(alpha: f64, k: f64, warmup: u32) -> StreamAnomalyDetector {
    StreamAnomalyDetector::new(DetectorConfig::new(alpha, k, warmup)).unwrap()
}

fn run(config: DetectorConfig, values: &[f64]) -> Vec<Verdict> {
    let mut d = StreamAnomalyDetector::new(config).unwrap();
    values.iter().map(|v| d.observe(*v).unwrap()).collect()
}

#[test]
fn spike_after_warmup_is_flagged() {
    let verdicts = run(
        DetectorConfig::new(0.3, 3.0, 5),
        &[20.0, 21.0, 20.0, 22.0, 21.0, 50.0],
    );

    assert!(verdicts[..5].iter().all(|v| !v.is_anomaly));
    assert!(verdicts[5].is_anomaly, "{:?}", verdicts[5]);
}

#[test]
fn constant_input_converges() {
    let mut d = detector(0.5, 1.0, 2);
    d.observe(12.0).unwrap();
    d.observe(4.0).unwrap();

    let mut last_gap = (d.mean().unwrap() - 10.0).abs();
    let mut last_dev = d.deviation().unwrap();
    for _ in 0..30 {
        d.observe(10.0).unwrap();
        let gap = (d.mean().unwrap() - 10.0).abs();
        let dev = d.deviation().unwrap();
        assert!(gap <= last_gap, "mean moved away: {} -> {}", last_gap, gap);
        assert!(dev <= last_dev, "deviation grew: {} -> {}", last_dev, dev);
        last_gap = gap;
        last_dev = dev;
    }
    assert!(last_gap < 1e-4);
    assert!(last_dev < 1e-4);
}

#[test]
fn constant_stream_stays_put() {
    let mut d = detector(0.5, 3.0, 1);
    for _ in 0..5 {
        let verdict = d.observe(10.0).unwrap();
        assert_eq!(verdict.mean, 10.0);
        assert!(!verdict.is_anomaly);
    }
    assert_eq!(d.deviation(), Some(0.0));
}

#[test]
fn gradual_drift_is_tracked_but_jump_is_flagged() {
    let config = DetectorConfig::new(0.5, 1.5, 5);
    let ramp: Vec<f64> = (0..=30).map(|i| 20.0 + 0.5 * i as f64).collect();

    let verdicts = run(config, &ramp);
    assert!(
        verdicts.iter().all(|v| !v.is_anomaly),
        "steady ramp should not be flagged"
    );

    let mut jumped = ramp.clone();
    for v in jumped.iter_mut().skip(15) {
        *v += 10.0;
    }
    let verdicts = run(config, &jumped);
    let flagged: Vec<usize> = verdicts
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_anomaly)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(flagged, vec![15]);
}

#[test]
fn nan_leaves_state_unchanged() {
    let mut d = detector(0.3, 3.0, 2);
    for v in [5.0, 6.0, 7.0] {
        d.observe(v).unwrap();
    }
    let (mean, deviation, count) = (d.mean(), d.deviation(), d.sample_count());

    let err = d.observe(f64::NAN).unwrap_err();
    assert!(matches!(err, DetectorError::NonFiniteInput { .. }));
    assert_eq!(d.mean(), mean);
    assert_eq!(d.deviation(), deviation);
    assert_eq!(d.sample_count(), count);

    // Calibration survives for the next valid call.
    assert!(d.observe(7.5).is_ok());
    assert_eq!(d.sample_count(), count + 1);
}

#[test]
fn configuration_validation() {
    for (alpha, k) in [(0.0, 1.0), (1.5, 1.0), (0.5, -1.0)] {
        assert!(matches!(
            StreamAnomalyDetector::new(DetectorConfig::new(alpha, k, 1)),
            Err(DetectorError::InvalidConfiguration { .. })
        ));
    }
    assert!(StreamAnomalyDetector::new(DetectorConfig::new(1.0, 1.0, 1)).is_ok());
}

#[test]
fn state_stays_bounded_as_stream_grows() {
    let mut d = detector(0.2, 2.0, 1);

    for i in 0..1_000 {
        d.observe((i % 17) as f64).unwrap();
    }
    let after_n = d.snapshot();
    for i in 0..10_000 {
        d.observe((i % 17) as f64 + 1.0).unwrap();
    }
    let after_10n = d.snapshot();

    // Same fixed set of fields, each finite and updated in place.
    assert_eq!(after_n.config, after_10n.config);
    assert_eq!(after_n.sample_count, 1_000);
    assert_eq!(after_10n.sample_count, 11_000);
    for snap in [&after_n, &after_10n] {
        let mean = snap.mean.unwrap();
        let deviation = snap.deviation.unwrap();
        assert!(mean.is_finite() && (0.0..=17.0).contains(&mean), "{:?}", snap);
        assert!(deviation.is_finite() && deviation >= 0.0, "{:?}", snap);
    }
    assert_ne!(after_n.mean, after_10n.mean);
}

#[test]
fn phase_transitions_once() {
    let mut d = detector(0.3, 3.0, 3);
    let phases: Vec<Phase> = (0..6)
        .map(|i| d.observe(i as f64).unwrap().phase)
        .collect();
    assert_eq!(
        phases,
        vec![
            Phase::Warming,
            Phase::Warming,
            Phase::Warming,
            Phase::Steady,
            Phase::Steady,
            Phase::Steady
        ]
    );
}

fn finite_stream() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-1.0e6..1.0e6f64, 1..200)
}

fn any_config() -> impl Strategy<Value = DetectorConfig> {
    (0.01..=1.0f64, 0.1..10.0f64, 1u32..40, prop::bool::ANY).prop_map(|(alpha, k, warmup, sq)| {
        let estimator = if sq {
            DeviationEstimator::StdDev
        } else {
            DeviationEstimator::AbsoluteDeviation
        };
        DetectorConfig::new(alpha, k, warmup).with_estimator(estimator)
    })
}

proptest! {
    #[test]
    fn prop_deterministic(config in any_config(), values in finite_stream()) {
        prop_assert_eq!(run(config, &values), run(config, &values));
    }

    #[test]
    fn prop_warmup_suppresses_verdicts(config in any_config(), values in finite_stream()) {
        let warmup = config.warmup_count as usize;
        for verdict in run(config, &values).iter().take(warmup) {
            prop_assert!(!verdict.is_anomaly);
        }
    }

    #[test]
    fn prop_non_finite_is_atomic(config in any_config(), values in finite_stream()) {
        let mut d = StreamAnomalyDetector::new(config).unwrap();
        for v in &values {
            d.observe(*v).unwrap();
        }
        let before = d.snapshot();
        prop_assert!(d.observe(f64::INFINITY).is_err());
        prop_assert_eq!(d.snapshot(), before);
    }

    #[test]
    fn prop_threshold_is_non_negative(config in any_config(), values in finite_stream()) {
        for verdict in run(config, &values) {
            prop_assert!(verdict.threshold >= 0.0);
            prop_assert!(verdict.deviation >= 0.0);
        }
    }
}
