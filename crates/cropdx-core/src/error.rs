use std::path::PathBuf;

use thiserror::Error;

use crate::types::TrainingHistory;

/// Errors that can occur while building or training a crop disease classifier.
#[derive(Debug, Error)]
pub enum CropdxError {
    /// Missing or unusable input directory, zero classes, or invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The classifier could not be assembled (bad class count, input size).
    #[error("model build error: {0}")]
    ModelBuild(String),

    /// Backbone weights are missing, unreadable, or lack expected tensors.
    #[error("backbone weights error: {0}")]
    BackboneWeights(String),

    /// The fit loop aborted. Carries the epoch that failed and the history so far.
    #[error("training failed at epoch {epoch}: {source}")]
    Training {
        /// 1-based epoch during which the failure happened.
        epoch: usize,
        /// Records of every epoch that completed before the failure.
        history: TrainingHistory,
        /// The underlying cause.
        #[source]
        source: Box<CropdxError>,
    },

    /// An image file could not be decoded.
    #[error("failed to decode image {path:?}: {message}")]
    ImageDecode {
        /// The offending file.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },

    /// A model artifact or label map is malformed.
    #[error("invalid artifact: {0}")]
    Artifact(String),

    /// JSON or safetensors (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Candle ML framework error.
    #[error("ML error: {0}")]
    Candle(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<candle_core::Error> for CropdxError {
    fn from(err: candle_core::Error) -> Self {
        Self::Candle(err.to_string())
    }
}

impl From<serde_json::Error> for CropdxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for CropdxError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl CropdxError {
    /// Returns `true` for errors raised before any training started.
    #[must_use]
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::ModelBuild(_) | Self::BackboneWeights(_)
        )
    }
}

/// Result type alias for cropdx operations.
pub type Result<T> = std::result::Result<T, CropdxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = CropdxError::Configuration("data directory './data' not found".into());
        assert_eq!(
            err.to_string(),
            "configuration error: data directory './data' not found"
        );

        let err = CropdxError::Training {
            epoch: 4,
            history: TrainingHistory::default(),
            source: Box::new(CropdxError::Io(std::io::Error::other("disk full"))),
        };
        assert!(err.to_string().contains("epoch 4"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn setup_errors_are_classified() {
        assert!(CropdxError::Configuration("x".into()).is_setup_error());
        assert!(CropdxError::ModelBuild("x".into()).is_setup_error());
        assert!(CropdxError::BackboneWeights("x".into()).is_setup_error());
        assert!(!CropdxError::Candle("x".into()).is_setup_error());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CropdxError>();
    }
}
