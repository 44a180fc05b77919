use airsync_shared_protocol::CodecError;
use thiserror::Error;

/// Terminal failures of a calibration session.
///
/// Weak or missing detections are not errors; they surface through
/// [`crate::MeasurementQuality`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("microphone access denied")]
    PermissionDenied,
    #[error("receiver request failed: {0}")]
    Network(String),
    #[error("could not decode receiver response: {0}")]
    Decode(String),
    #[error("audio capture failed: {0}")]
    Capture(String),
    #[error("calibration cancelled")]
    Cancelled,
    #[error("session has already run")]
    AlreadyRan,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CalibrationError>;

impl From<reqwest::Error> for CalibrationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CalibrationError::Decode(err.to_string())
        } else {
            CalibrationError::Network(err.to_string())
        }
    }
}

impl From<CodecError> for CalibrationError {
    fn from(err: CodecError) -> Self {
        CalibrationError::Decode(err.to_string())
    }
}
