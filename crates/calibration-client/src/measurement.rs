use airsync_shared_protocol::{CalibrationSubmission, DetectionReport};
use serde::{Deserialize, Serialize};

/// Confidence below which a measurement is reported as low confidence.
pub const LOW_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionRole {
    /// Contributed to the final latency.
    Used,
    /// Disagreed with the consensus and was dropped by MAD rejection.
    Outlier,
    /// Accepted, but not in the aggregation pool because anchors were available.
    Supporting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub marker_id: String,
    pub sample_index: u64,
    pub correlation: f32,
    pub latency_ms: f32,
    pub anchor: bool,
    pub role: DetectionRole,
}

impl Detection {
    pub fn report(&self) -> DetectionReport {
        DetectionReport {
            marker_id: self.marker_id.clone(),
            sample_index: self.sample_index,
            correlation: self.correlation,
            latency_ms: self.latency_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementQuality {
    NoDetections,
    LowConfidence,
    Good,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyMeasurement {
    pub latency_ms: f32,
    pub confidence: f32,
    pub detections: Vec<Detection>,
}

impl LatencyMeasurement {
    /// The "found nothing" result: zero latency, zero confidence.
    pub fn empty() -> Self {
        Self {
            latency_ms: 0.0,
            confidence: 0.0,
            detections: Vec::new(),
        }
    }

    pub fn used(&self) -> impl Iterator<Item = &Detection> {
        self.detections
            .iter()
            .filter(|d| d.role == DetectionRole::Used)
    }

    pub fn quality(&self) -> MeasurementQuality {
        if self.detections.is_empty() {
            MeasurementQuality::NoDetections
        } else if self.confidence < LOW_CONFIDENCE {
            MeasurementQuality::LowConfidence
        } else {
            MeasurementQuality::Good
        }
    }

    pub fn to_submission(&self, timestamp: u64) -> CalibrationSubmission {
        CalibrationSubmission {
            timestamp,
            latency_ms: self.latency_ms,
            confidence: self.confidence,
            detections: self.detections.iter().map(Detection::report).collect(),
        }
    }
}
