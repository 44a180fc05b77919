use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

/// Constant-frequency chirps at or below this frequency are warm-up/warm-down hum.
pub const HUM_MAX_FREQ_HZ: u32 = 250;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChirpConfig {
    pub start_freq: u32,
    pub end_freq: u32,
    pub duration: u32,
    pub repetitions: u32,
    pub interval_ms: u32,
    #[serde(default)]
    pub amplitude: Option<f32>,
}

impl Default for ChirpConfig {
    fn default() -> Self {
        Self {
            start_freq: 1000,
            end_freq: 10000,
            duration: 100,
            repetitions: 6,
            interval_ms: 400,
            amplitude: None,
        }
    }
}

/// Shape of a single marker.
///
/// Encodes as the bare tag `"click"` or as `{"chirp": {...}}`. Decoding goes
/// through [`MarkerKind::from_wire`], which accepts exactly those shapes (plus
/// `{"click": {}}` as emitted by some producers) and rejects everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Click,
    Chirp {
        start_freq: u32,
        end_freq: u32,
        duration_ms: u32,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChirpFields {
    start_freq: u32,
    end_freq: u32,
    duration_ms: u32,
}

impl MarkerKind {
    /// Decodes a marker kind from its JSON wire shape.
    ///
    /// Shapes are tried in a fixed order: bare string tag, then a single-key
    /// object keyed by the variant name. There is no fallback variant.
    pub fn from_wire(value: &Value) -> Result<Self, String> {
        if let Value::String(tag) = value {
            return match tag.as_str() {
                "click" => Ok(MarkerKind::Click),
                "chirp" => Err("chirp marker requires start_freq, end_freq and duration_ms".into()),
                other => Err(format!("unknown marker kind `{other}`")),
            };
        }

        let Value::Object(map) = value else {
            return Err(format!("marker kind must be a string or object, got {value}"));
        };
        if map.len() != 1 {
            return Err(format!(
                "marker kind object must have exactly one key, got {}",
                map.len()
            ));
        }
        let Some((key, body)) = map.iter().next() else {
            return Err("marker kind object is empty".into());
        };

        match key.as_str() {
            "click" => match body {
                Value::Null => Ok(MarkerKind::Click),
                Value::Object(inner) if inner.is_empty() => Ok(MarkerKind::Click),
                Value::Array(inner) if inner.is_empty() => Ok(MarkerKind::Click),
                other => Err(format!("click marker carries unexpected payload {other}")),
            },
            "chirp" => {
                let fields: ChirpFields = serde_json::from_value(body.clone())
                    .map_err(|e| format!("invalid chirp marker: {e}"))?;
                Ok(MarkerKind::Chirp {
                    start_freq: fields.start_freq,
                    end_freq: fields.end_freq,
                    duration_ms: fields.duration_ms,
                })
            }
            other => Err(format!("unknown marker kind `{other}`")),
        }
    }

    /// Length implied by the kind itself. Clicks carry their length on the marker.
    pub fn nominal_duration_samples(&self, sample_rate: u32) -> Option<u32> {
        match self {
            MarkerKind::Click => None,
            MarkerKind::Chirp { duration_ms, .. } => {
                Some(((*duration_ms as u64 * sample_rate as u64) / 1000) as u32)
            }
        }
    }
}

impl<'de> Deserialize<'de> for MarkerKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        MarkerKind::from_wire(&value).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkerSpec {
    pub id: String,
    pub kind: MarkerKind,
    pub start_sample: u32,
    pub duration_samples: u32,
}

impl MarkerSpec {
    pub fn end_sample(&self) -> u64 {
        self.start_sample as u64 + self.duration_samples as u64
    }

    /// Warm-up/warm-down hum regions: low constant-frequency tones that keep
    /// the amplifier awake but never serve as timing anchors.
    pub fn is_hum(&self) -> bool {
        matches!(
            self.kind,
            MarkerKind::Chirp { start_freq, end_freq, .. }
                if start_freq == end_freq && start_freq <= HUM_MAX_FREQ_HZ
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSignalSpec {
    pub sample_rate: u32,
    pub length_samples: u32,
    pub markers: Vec<MarkerSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("sample rate must be positive")]
    ZeroSampleRate,
    #[error("signal length must be positive")]
    ZeroLength,
    #[error("marker `{0}` has zero duration")]
    EmptyMarker(String),
    #[error("marker `{id}` ends at sample {end}, past signal length {length}")]
    MarkerOutOfBounds { id: String, end: u64, length: u32 },
    #[error("duplicate marker id `{0}`")]
    DuplicateMarker(String),
    #[error("chirp marker `{id}` spans {actual} samples, its duration implies {nominal}")]
    DurationMismatch { id: String, actual: u32, nominal: u32 },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed calibration spec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid calibration spec: {0}")]
    Invalid(#[from] SpecError),
}

impl CalibrationSignalSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.sample_rate == 0 {
            return Err(SpecError::ZeroSampleRate);
        }
        if self.length_samples == 0 {
            return Err(SpecError::ZeroLength);
        }
        let mut seen = HashSet::new();
        for marker in &self.markers {
            if !seen.insert(marker.id.as_str()) {
                return Err(SpecError::DuplicateMarker(marker.id.clone()));
            }
            if marker.duration_samples == 0 {
                return Err(SpecError::EmptyMarker(marker.id.clone()));
            }
            // One sample of slack for producers that round instead of truncating.
            if let Some(nominal) = marker.kind.nominal_duration_samples(self.sample_rate) {
                if marker.duration_samples.abs_diff(nominal) > 1 {
                    return Err(SpecError::DurationMismatch {
                        id: marker.id.clone(),
                        actual: marker.duration_samples,
                        nominal,
                    });
                }
            }
            if marker.end_sample() > self.length_samples as u64 {
                return Err(SpecError::MarkerOutOfBounds {
                    id: marker.id.clone(),
                    end: marker.end_sample(),
                    length: self.length_samples,
                });
            }
        }
        Ok(())
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.length_samples as u64 * 1000).div_ceil(self.sample_rate as u64)
    }

    pub fn marker(&self, id: &str) -> Option<&MarkerSpec> {
        self.markers.iter().find(|m| m.id == id)
    }
}

pub fn encode_spec(spec: &CalibrationSignalSpec) -> Result<String, CodecError> {
    Ok(serde_json::to_string(spec)?)
}

/// Decodes and validates a bare spec document.
pub fn decode_spec(json: &str) -> Result<CalibrationSignalSpec, CodecError> {
    let spec: CalibrationSignalSpec = serde_json::from_str(json)?;
    spec.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_spec() -> CalibrationSignalSpec {
        CalibrationSignalSpec {
            sample_rate: 48_000,
            length_samples: 240_000,
            markers: vec![
                MarkerSpec {
                    id: "a".into(),
                    kind: MarkerKind::Click,
                    start_sample: 0,
                    duration_samples: 480,
                },
                MarkerSpec {
                    id: "chirp1".into(),
                    kind: MarkerKind::Chirp {
                        start_freq: 1_000,
                        end_freq: 8_000,
                        duration_ms: 100,
                    },
                    start_sample: 10_000,
                    duration_samples: 4_800,
                },
            ],
        }
    }

    #[test]
    fn marker_spec_serializes() {
        let spec = sample_spec();
        let json = encode_spec(&spec).unwrap();
        assert!(json.contains("\"sample_rate\":48000"));
        assert!(json.contains("\"kind\":\"click\""));
        assert!(json.contains("\"kind\":{\"chirp\":{"));
        let round_trip = decode_spec(&json).unwrap();
        assert_eq!(round_trip, spec);
    }

    #[test]
    fn decodes_bare_tag_and_nested_object() {
        let value = json!({
            "sample_rate": 44_100,
            "length_samples": 10_000,
            "markers": [
                {"id": "c", "kind": "click", "start_sample": 0, "duration_samples": 100},
                {"id": "s", "kind": {"chirp": {"start_freq": 500, "end_freq": 900, "duration_ms": 20}},
                 "start_sample": 2_000, "duration_samples": 882}
            ]
        });
        let spec = decode_spec(&value.to_string()).unwrap();
        assert_eq!(spec.markers[0].kind, MarkerKind::Click);
        assert_eq!(
            spec.markers[1].kind,
            MarkerKind::Chirp {
                start_freq: 500,
                end_freq: 900,
                duration_ms: 20
            }
        );
    }

    #[test]
    fn accepts_click_keyed_by_empty_payload() {
        assert_eq!(MarkerKind::from_wire(&json!({"click": {}})), Ok(MarkerKind::Click));
        assert_eq!(MarkerKind::from_wire(&json!({"click": []})), Ok(MarkerKind::Click));
        assert_eq!(MarkerKind::from_wire(&json!({"click": null})), Ok(MarkerKind::Click));
    }

    #[test]
    fn rejects_unknown_shapes_instead_of_defaulting() {
        for bad in [
            json!("sweep"),
            json!("chirp"),
            json!(42),
            json!({"chirp": {"start_freq": 1}}),
            json!({"chirp": {"start_freq": 1, "end_freq": 2, "duration_ms": 3, "gain": 1}}),
            json!({"click": {"len": 3}}),
            json!({"click": {}, "chirp": {}}),
            json!({}),
        ] {
            assert!(MarkerKind::from_wire(&bad).is_err(), "accepted {bad}");
        }

        let doc = json!({
            "sample_rate": 48_000,
            "length_samples": 100,
            "markers": [{"id": "x", "kind": {"tone": 1}, "start_sample": 0, "duration_samples": 1}]
        });
        assert!(matches!(decode_spec(&doc.to_string()), Err(CodecError::Json(_))));
    }

    #[test]
    fn validation_catches_structural_errors() {
        let mut spec = sample_spec();
        spec.markers[1].start_sample = 239_000;
        assert!(matches!(
            spec.validate(),
            Err(SpecError::MarkerOutOfBounds { .. })
        ));

        let mut spec = sample_spec();
        spec.markers[1].id = "a".into();
        assert_eq!(spec.validate(), Err(SpecError::DuplicateMarker("a".into())));

        let mut spec = sample_spec();
        spec.sample_rate = 0;
        assert_eq!(spec.validate(), Err(SpecError::ZeroSampleRate));

        let mut spec = sample_spec();
        spec.markers[1].duration_samples = 2_400;
        assert_eq!(
            spec.validate(),
            Err(SpecError::DurationMismatch {
                id: "chirp1".into(),
                actual: 2_400,
                nominal: 4_800
            })
        );
        spec.markers[1].duration_samples = 4_801;
        assert_eq!(spec.validate(), Ok(()));

        let json = serde_json::to_string(&CalibrationSignalSpec {
            length_samples: 0,
            ..sample_spec()
        })
        .unwrap();
        assert!(matches!(
            decode_spec(&json),
            Err(CodecError::Invalid(SpecError::ZeroLength))
        ));
    }

    #[test]
    fn hum_classification() {
        let hum = MarkerSpec {
            id: "warmup".into(),
            kind: MarkerKind::Chirp {
                start_freq: 120,
                end_freq: 120,
                duration_ms: 400,
            },
            start_sample: 0,
            duration_samples: 19_200,
        };
        assert!(hum.is_hum());
        assert!(!sample_spec().markers.iter().any(MarkerSpec::is_hum));
        assert_eq!(
            hum.kind.nominal_duration_samples(48_000),
            Some(19_200)
        );
    }

    #[test]
    fn chirp_config_amplitude_is_optional() {
        let cfg: ChirpConfig = serde_json::from_value(json!({
            "start_freq": 1000, "end_freq": 2000, "duration": 50,
            "repetitions": 2, "interval_ms": 100
        }))
        .unwrap();
        assert_eq!(cfg.amplitude, None);
    }
}
