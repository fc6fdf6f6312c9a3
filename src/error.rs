//! Error types for the OCTCube finetuning pipeline.

use thiserror::Error;

/// Main error type for indexing, partitioning and fold orchestration.
#[derive(Error, Debug)]
pub enum OctError {
    /// Invalid configuration or option combination
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A referenced patient or visit is missing from the backing metadata
    #[error("Metadata inconsistency: {0}")]
    MetadataInconsistency(String),

    /// Task mode that the index cannot build label tables for
    #[error("Unsupported task mode: {0}")]
    UnsupportedTaskMode(String),

    /// Dataset mode outside the supported set
    #[error("Unsupported dataset mode: {0}")]
    UnsupportedDatasetMode(String),

    /// Evaluation produced a metric that is undefined (e.g. single-class labels)
    #[error("Degenerate evaluation: {0}")]
    DegenerateEvaluation(String),

    /// Loss became NaN or infinite under the abort policy
    #[error("Non-finite loss at epoch {epoch}: {value}")]
    NonFiniteLoss { epoch: usize, value: f64 },

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OctError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        OctError::Configuration(msg.into())
    }

    /// Whether this error should only end the current fold
    pub fn is_fold_scoped(&self) -> bool {
        matches!(self, OctError::DegenerateEvaluation(_))
    }
}

impl From<serde_json::Error> for OctError {
    fn from(err: serde_json::Error) -> Self {
        OctError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for OctError {
    fn from(err: csv::Error) -> Self {
        OctError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for OctError {
    fn from(err: image::ImageError) -> Self {
        OctError::Image(err.to_string())
    }
}

/// Specialized Result type for library operations.
pub type Result<T> = std::result::Result<T, OctError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OctError::config("downsample factor must be >= 1");
        assert_eq!(
            err.to_string(),
            "Configuration error: downsample factor must be >= 1"
        );

        let err = OctError::NonFiniteLoss { epoch: 3, value: f64::NAN };
        assert!(err.to_string().contains("epoch 3"));
    }

    #[test]
    fn test_fold_scoped() {
        assert!(OctError::DegenerateEvaluation("one class".into()).is_fold_scoped());
        assert!(!OctError::config("bad").is_fold_scoped());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: OctError = io_err.into();
        assert!(matches!(err, OctError::Io(_)));
    }
}
