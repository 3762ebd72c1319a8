use std::os::raw::{c_double, c_int, c_uint, c_ulonglong};

pub mod algo;
pub mod config;
pub mod detector;
pub mod error;
pub mod gatekeeper;
pub mod generator;
pub mod registry;

pub use algo::ewma::DeviationEstimator;
pub use config::AppConfig;
pub use detector::{
    DetectorConfig, DetectorSnapshot, Observation, Phase, StreamAnomalyDetector, Verdict,
};
pub use error::{DetectorError, Result};
pub use registry::{RegistryConfig, StreamRegistry};

// --- Detector FFI ---

pub const FFI_OK: c_int = 0;
pub const FFI_NULL_POINTER: c_int = -1;
pub const FFI_NON_FINITE: c_int = -2;

/// C-compatible mirror of [`Verdict`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FfiVerdict {
    pub is_anomaly: bool,
    /// True until the threshold applies
    pub warming: bool,
    pub mean: c_double,
    pub threshold: c_double,
    pub deviation: c_double,
    pub sample_count: c_ulonglong,
}

/// Returns null when the configuration is rejected.
#[unsafe(no_mangle)]
pub extern "C" fn ewma_detector_create(
    alpha: c_double,
    k: c_double,
    warmup_count: c_uint,
) -> *mut StreamAnomalyDetector {
    match StreamAnomalyDetector::new(DetectorConfig::new(alpha, k, warmup_count)) {
        Ok(detector) => Box::into_raw(Box::new(detector)),
        Err(_) => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn ewma_detector_free(ptr: *mut StreamAnomalyDetector) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(ptr);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn ewma_detector_observe(
    ptr: *mut StreamAnomalyDetector,
    value: c_double,
    out_verdict: *mut FfiVerdict,
) -> c_int {
    if ptr.is_null() || out_verdict.is_null() {
        return FFI_NULL_POINTER;
    }

    let detector = unsafe { &mut *ptr };
    let verdict = match detector.observe(value) {
        Ok(verdict) => verdict,
        Err(_) => return FFI_NON_FINITE,
    };

    unsafe {
        *out_verdict = FfiVerdict {
            is_anomaly: verdict.is_anomaly,
            warming: verdict.phase == Phase::Warming,
            mean: verdict.mean,
            threshold: verdict.threshold,
            deviation: verdict.deviation,
            sample_count: detector.sample_count(),
        };
    }
    FFI_OK
}

#[unsafe(no_mangle)]
pub extern "C" fn ewma_detector_reset(ptr: *mut StreamAnomalyDetector) {
    if ptr.is_null() {
        return;
    }
    let detector = unsafe { &mut *ptr };
    detector.reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffi_lifecycle() {
        let ptr = ewma_detector_create(0.3, 3.0, 5);
        assert!(!ptr.is_null());

        let mut out = FfiVerdict::default();
        for v in [20.0, 21.0, 20.0, 22.0, 21.0] {
            assert_eq!(ewma_detector_observe(ptr, v, &mut out), FFI_OK);
            assert!(out.warming);
            assert!(!out.is_anomaly);
        }

        assert_eq!(ewma_detector_observe(ptr, 50.0, &mut out), FFI_OK);
        assert!(out.is_anomaly);
        assert!(!out.warming);
        assert_eq!(out.sample_count, 6);

        assert_eq!(ewma_detector_observe(ptr, f64::NAN, &mut out), FFI_NON_FINITE);
        assert_eq!(out.sample_count, 6);

        ewma_detector_reset(ptr);
        assert_eq!(ewma_detector_observe(ptr, 1.0, &mut out), FFI_OK);
        assert_eq!(out.sample_count, 1);

        ewma_detector_free(ptr);
    }

    #[test]
    fn test_ffi_rejects_bad_input() {
        assert!(ewma_detector_create(0.0, 3.0, 5).is_null());
        assert!(ewma_detector_create(0.5, -1.0, 5).is_null());

        let mut out = FfiVerdict::default();
        assert_eq!(
            ewma_detector_observe(std::ptr::null_mut(), 1.0, &mut out),
            FFI_NULL_POINTER
        );
        ewma_detector_free(std::ptr::null_mut());
        ewma_detector_reset(std::ptr::null_mut());
    }
}
