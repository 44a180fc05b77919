//! Deterministic synthesis of the structured calibration signal.
//!
//! The receiver renders the whole signal for playback; the client renders
//! single-marker templates for matched filtering. Both go through
//! [`render_marker`], so the two sides agree sample for sample.

use crate::calibration::{CalibrationSignalSpec, MarkerKind, MarkerSpec};
use std::f64::consts::PI;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const MARKER_AMPLITUDE: f32 = 0.9;
pub const HUM_AMPLITUDE: f32 = 0.08;

const TARGET_LENGTH_MS: u32 = 4_700;

fn ms_to_samples(ms: u32, sample_rate: u32) -> u32 {
    ((ms as u64 * sample_rate as u64) / 1000) as u32
}

/// Symmetric Hann window; zero at both ends.
fn hann(n: usize, len: usize) -> f64 {
    if len <= 1 {
        return 1.0;
    }
    0.5 - 0.5 * (2.0 * PI * n as f64 / (len - 1) as f64).cos()
}

/// Renders one marker in isolation, `duration_samples` long.
pub fn render_marker(marker: &MarkerSpec, sample_rate: u32) -> Vec<f32> {
    let len = marker.duration_samples as usize;
    match marker.kind {
        MarkerKind::Click => vec![MARKER_AMPLITUDE; len],
        MarkerKind::Chirp {
            start_freq,
            end_freq,
            duration_ms,
        } => {
            let sr = sample_rate.max(1) as f64;
            let duration_s = if duration_ms > 0 {
                duration_ms as f64 / 1000.0
            } else {
                len as f64 / sr
            };
            let f0 = start_freq as f64;
            let k = if duration_s > 0.0 {
                (end_freq as f64 - f0) / duration_s
            } else {
                0.0
            };
            let amp = if marker.is_hum() {
                HUM_AMPLITUDE
            } else {
                MARKER_AMPLITUDE
            } as f64;

            (0..len)
                .map(|n| {
                    let t = n as f64 / sr;
                    let phase = 2.0 * PI * (f0 * t + 0.5 * k * t * t);
                    (phase.sin() * amp * hann(n, len)) as f32
                })
                .collect()
        }
    }
}

/// Renders the full signal: exactly `length_samples` mono samples in [-1, 1].
pub fn synthesize(spec: &CalibrationSignalSpec) -> Vec<f32> {
    let length = spec.length_samples as usize;
    let mut samples = vec![0.0f32; length];
    for marker in &spec.markers {
        let start = marker.start_sample as usize;
        if start >= length {
            continue;
        }
        let template = render_marker(marker, spec.sample_rate);
        for (slot, value) in samples[start..].iter_mut().zip(template) {
            *slot += value;
        }
    }
    for s in samples.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
    samples
}

pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect()
}

struct SpecBuilder {
    sample_rate: u32,
    cursor: u32,
    markers: Vec<MarkerSpec>,
}

impl SpecBuilder {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            cursor: 0,
            markers: Vec::new(),
        }
    }

    fn gap(&mut self, ms: u32) {
        self.cursor += ms_to_samples(ms, self.sample_rate);
    }

    fn click(&mut self, id: &str, ms: u32) {
        let len = ms_to_samples(ms, self.sample_rate);
        self.push(id, MarkerKind::Click, len);
    }

    fn chirp(&mut self, id: &str, start_freq: u32, end_freq: u32, duration_ms: u32) {
        let kind = MarkerKind::Chirp {
            start_freq,
            end_freq,
            duration_ms,
        };
        let len = ms_to_samples(duration_ms, self.sample_rate);
        self.push(id, kind, len);
    }

    fn push(&mut self, id: &str, kind: MarkerKind, len: u32) {
        self.markers.push(MarkerSpec {
            id: id.to_string(),
            kind,
            start_sample: self.cursor,
            duration_samples: len,
        });
        self.cursor += len;
    }

    fn finish(self, target_ms: u32) -> CalibrationSignalSpec {
        let length_samples = ms_to_samples(target_ms, self.sample_rate).max(self.cursor);
        CalibrationSignalSpec {
            sample_rate: self.sample_rate,
            length_samples,
            markers: self.markers,
        }
    }
}

/// The signal the receiver plays for structured calibration.
pub fn structured_signal_spec() -> CalibrationSignalSpec {
    let mut b = SpecBuilder::new(DEFAULT_SAMPLE_RATE);

    b.chirp("warmup", 120, 120, 400);
    b.gap(80);
    b.click("click_a", 10);
    b.gap(200);
    b.chirp("sweep_anchor", 400, 9_000, 150);
    b.gap(200);

    let bands = [
        (800, 2_800),
        (1_000, 3_000),
        (3_000, 5_000),
        (6_000, 8_000),
        (8_000, 10_000),
        (10_000, 12_000),
        (4_000, 6_000),
    ];
    for (idx, (lo, hi)) in bands.iter().enumerate() {
        b.chirp(&format!("chirp_{}", idx + 1), *lo, *hi, 100);
        b.gap(280);
    }

    b.gap(200);
    b.click("click_b", 10);
    b.gap(60);
    b.chirp("warmdown", 200, 200, 200);

    b.finish(TARGET_LENGTH_MS)
}
