//! Error types for the detector, its configuration and the synthetic stream.

use thiserror::Error;

/// Errors raised by [`StreamAnomalyDetector`](crate::detector::StreamAnomalyDetector)
/// and the registry built on top of it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectorError {
    #[error("Invalid configuration: {name} - {reason}")]
    InvalidConfiguration { name: String, reason: String },

    #[error("Non-finite input: {value}")]
    NonFiniteInput { value: f64 },

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl DetectorError {
    pub(crate) fn invalid_config(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for detector operations.
pub type Result<T> = std::result::Result<T, DetectorError>;

/// Errors raised while loading an [`AppConfig`](crate::config::AppConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("Invalid server setting: {0}")]
    Server(String),
}

/// Errors raised while starting the ingest service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the synthetic stream generator.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Invalid generator parameter: {name} - {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_configuration_display() {
        let error = DetectorError::invalid_config("alpha", "must be in (0, 1], got 1.5");
        assert_eq!(
            error.to_string(),
            "Invalid configuration: alpha - must be in (0, 1], got 1.5"
        );
    }

    #[test]
    fn test_non_finite_display() {
        let error = DetectorError::NonFiniteInput {
            value: f64::INFINITY,
        };
        assert_eq!(error.to_string(), "Non-finite input: inf");
    }

    #[test]
    fn test_config_error_wraps_detector_error() {
        let inner = DetectorError::invalid_config("k", "must be positive");
        let error: ConfigError = inner.clone().into();
        assert_eq!(error.to_string(), inner.to_string());
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DetectorError>();
        assert_send_sync::<ConfigError>();
        assert_send_sync::<GeneratorError>();
        assert_send_sync::<ServiceError>();
    }
}
