pub mod client;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod measurement;
pub mod recorder;
pub mod scoring;
pub mod session;

pub use client::{HttpReceiverClient, ReceiverApi};
pub use clock::{Clock, ClockOffsetEstimator, ClockSample, SystemClock};
pub use config::{CalibrationConfig, DetectorConfig};
pub use detector::{normalized_cross_correlation, MarkerDetector};
pub use error::{CalibrationError, Result};
pub use measurement::{Detection, DetectionRole, LatencyMeasurement, MeasurementQuality};
pub use recorder::{
    AudioSessionConfig, CancelSignal, CancellationHandle, Capture, RecordedAudio, Recorder,
    RecordingRequest,
};
pub use session::{CalibrationSession, CalibrationStage, StageEvent};
