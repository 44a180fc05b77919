use crate::calibration::{CalibrationSignalSpec, ChirpConfig, CodecError};
use serde::{Deserialize, Serialize};

/// Body of `GET /calibration/spec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecResponse {
    pub spec: CalibrationSignalSpec,
}

impl SpecResponse {
    pub fn decode(json: &str) -> Result<CalibrationSignalSpec, CodecError> {
        let response: SpecResponse = serde_json::from_str(json)?;
        response.spec.validate()?;
        Ok(response.spec)
    }
}

/// Body of `POST /calibration/request`. Arms playback, does not start it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRequest {
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chirp_config: Option<ChirpConfig>,
    pub delay_ms: u32,
    #[serde(default = "default_structured")]
    pub structured: bool,
}

fn default_structured() -> bool {
    true
}

/// Body of `POST /calibration/ready`. Commits playback to an absolute receiver-clock instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReady {
    pub timestamp: u64,
    pub target_start_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub marker_id: String,
    pub sample_index: u64,
    pub correlation: f32,
    pub latency_ms: f32,
}

/// Body of `POST /calibration/result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSubmission {
    pub timestamp: u64,
    pub latency_ms: f32,
    pub confidence: f32,
    #[serde(default)]
    pub detections: Vec<DetectionReport>,
}

/// Body of `GET /time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTime {
    pub server_time_ms: u64,
}
