//! Error taxonomy for the detection pipeline

use thiserror::Error;

use crate::jobs::JobStatus;

/// Errors raised by detectors, the pipeline and the job orchestrator
#[derive(Debug, Error)]
pub enum DetectionError {
    /// Contour extraction or template matching failed
    #[error(
        "pattern matching failed after {elapsed_ms}ms on {buffer_size} byte buffer \
         (budget exceeded: {budget_exceeded}): {message}"
    )]
    PatternMatching {
        message: String,
        buffer_size: usize,
        /// Debug rendering of the matching options in effect
        options: String,
        elapsed_ms: u64,
        budget_exceeded: bool,
    },

    /// Region proposal or inference failed
    #[error(
        "ML classification failed on {buffer_size} byte buffer \
         with {existing_symbols} existing symbols: {message}"
    )]
    MlClassification {
        message: String,
        buffer_size: usize,
        existing_symbols: usize,
    },

    /// Decoding, preprocessing or feature extraction failed
    #[error("image processing failed: {0}")]
    ImageProcessing(String),

    /// Orchestration or lifecycle failure
    #[error("detection job error: {0}")]
    DetectionJob(String),

    /// A job status change the state machine does not allow
    #[error("invalid job transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("detection cancelled")]
    Cancelled,

    #[error("detection timed out after {0}ms")]
    Timeout(u64),
}

impl DetectionError {
    /// Short machine-readable kind, used in events and persisted job detail
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::PatternMatching { .. } => "pattern_matching_error",
            DetectionError::MlClassification { .. } => "ml_classification_error",
            DetectionError::ImageProcessing(_) => "image_processing_error",
            DetectionError::DetectionJob(_) => "detection_job_error",
            DetectionError::InvalidTransition { .. } => "invalid_transition",
            DetectionError::Cancelled => "cancelled",
            DetectionError::Timeout(_) => "timeout",
        }
    }
}

pub type Result<T> = std::result::Result<T, DetectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_error_message_carries_timing() {
        let err = DetectionError::PatternMatching {
            message: "boom".to_string(),
            buffer_size: 42,
            options: "{}".to_string(),
            elapsed_ms: 1200,
            budget_exceeded: true,
        };
        let text = err.to_string();
        assert!(text.contains("1200ms"));
        assert!(text.contains("42 byte"));
        assert_eq!(err.kind(), "pattern_matching_error");
    }
}
