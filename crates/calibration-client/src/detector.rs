//! Matched-filter marker detection.
//!
//! Each marker's reference template is rendered with the same synthesis code
//! the receiver uses for playback, then located in the recording by
//! normalized cross-correlation inside a bounded window around its expected
//! position. The search is a strided coarse pass followed by an exhaustive
//! pass in a small neighbourhood of the best coarse candidate.
//!
//! Correlation is zero-mean: template and segment both have their mean
//! removed, so DC offset and slow rumble do not read as a match. A click is
//! a flat burst, which is all mean, so its template carries a stretch of
//! silence on each side and matches the burst's edges.

use crate::config::DetectorConfig;
use crate::measurement::LatencyMeasurement;
use crate::scoring::{self, Candidate};
use airsync_shared_protocol::synth::render_marker;
use airsync_shared_protocol::{CalibrationSignalSpec, MarkerKind, MarkerSpec};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Peak amplitude below which a recording is treated as silence.
const SILENCE_FLOOR: f32 = 1e-6;
/// Window energy below which a segment cannot correlate with anything.
const ENERGY_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerMatch {
    pub sample_index: usize,
    pub correlation: f32,
}

/// Zero-mean, peak-normalized template plus its energy.
struct Template {
    samples: Vec<f32>,
    energy: f64,
    /// Offset of the marker's first sample within `samples`.
    lead: usize,
}

pub struct MarkerDetector {
    config: DetectorConfig,
    templates: Mutex<HashMap<(MarkerSpec, u32), Arc<Template>>>,
}

impl MarkerDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            templates: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn template(&self, marker: &MarkerSpec, sample_rate: u32) -> Arc<Template> {
        let key = (marker.clone(), sample_rate);
        if let Ok(cache) = self.templates.lock() {
            if let Some(t) = cache.get(&key) {
                return t.clone();
            }
        }

        let body = render_marker(marker, sample_rate);
        let lead = match marker.kind {
            MarkerKind::Click => body.len(),
            MarkerKind::Chirp { .. } => 0,
        };
        let mut samples = vec![0.0f32; lead];
        samples.extend(body);
        samples.resize(samples.len() + lead, 0.0);
        normalize_peak(&mut samples);
        remove_mean(&mut samples);
        let energy = samples.iter().map(|s| *s as f64 * *s as f64).sum();
        let template = Arc::new(Template {
            samples,
            energy,
            lead,
        });

        if let Ok(mut cache) = self.templates.lock() {
            cache.insert(key, template.clone());
        }
        template
    }

    /// Locates every marker of `spec` in `recording` and aggregates the result.
    ///
    /// `start_offset_samples` is the recording index where sample 0 of the
    /// signal is expected to land if playback had zero latency.
    pub fn detect(
        &self,
        recording: &[f32],
        spec: &CalibrationSignalSpec,
        start_offset_samples: i64,
    ) -> LatencyMeasurement {
        let peak = peak_abs(recording);
        if peak <= SILENCE_FLOOR || spec.markers.is_empty() {
            tracing::info!(
                samples = recording.len(),
                peak,
                "recording is silent, nothing to detect"
            );
            return LatencyMeasurement::empty();
        }

        let normalized: Vec<f32> = recording.iter().map(|s| s / peak).collect();
        let prefix = Prefix::new(&normalized);
        let window = (self.config.search_window_ms as i64 * spec.sample_rate as i64) / 1000;

        let mut candidates = Vec::with_capacity(spec.markers.len());
        for marker in &spec.markers {
            let template = self.template(marker, spec.sample_rate);
            let n = template.samples.len();
            if n == 0 || n > normalized.len() {
                continue;
            }

            let expected = marker.start_sample as i64 + start_offset_samples;
            let template_at = expected - template.lead as i64;
            let last_start = (normalized.len() - n) as i64;
            let lo = (template_at - window).max(0);
            let hi = (template_at + window).min(last_start);
            if lo > hi {
                tracing::debug!(marker = %marker.id, expected, "search window outside recording");
                continue;
            }

            let Some(found) = self.search(&normalized, &prefix, &template, lo as usize, hi as usize)
            else {
                continue;
            };
            let found = MarkerMatch {
                sample_index: found.sample_index + template.lead,
                ..found
            };

            if found.correlation < self.config.min_correlation {
                tracing::debug!(
                    marker = %marker.id,
                    correlation = %format!("{:.3}", found.correlation),
                    "marker_below_threshold"
                );
                continue;
            }

            tracing::debug!(
                marker = %marker.id,
                expected,
                found = found.sample_index,
                correlation = %format!("{:.3}", found.correlation),
                "marker_detected"
            );
            candidates.push(Candidate {
                marker,
                sample_index: found.sample_index,
                correlation: found.correlation,
            });
        }

        scoring::aggregate(&candidates, spec, start_offset_samples, &self.config)
    }

    fn search(
        &self,
        recording: &[f32],
        prefix: &Prefix,
        template: &Template,
        lo: usize,
        hi: usize,
    ) -> Option<MarkerMatch> {
        let stride = self.config.coarse_stride.max(1);
        let mut best: Option<MarkerMatch> = None;

        let consider = |s: usize, best: &mut Option<MarkerMatch>| {
            let c = ncc_at(recording, prefix, template, s);
            if best.map_or(true, |b| c > b.correlation) {
                *best = Some(MarkerMatch {
                    sample_index: s,
                    correlation: c,
                });
            }
        };

        let mut s = lo;
        while s <= hi {
            consider(s, &mut best);
            s += stride;
        }
        // The coarse grid may step over `hi`.
        consider(hi, &mut best);

        let coarse = best?;
        let from = coarse.sample_index.saturating_sub(self.config.refine_radius).max(lo);
        let to = (coarse.sample_index + self.config.refine_radius).min(hi);
        for s in from..=to {
            consider(s, &mut best);
        }
        best
    }
}

impl Default for MarkerDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

fn peak_abs(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

fn normalize_peak(samples: &mut [f32]) {
    let peak = peak_abs(samples);
    if peak > SILENCE_FLOOR {
        for s in samples.iter_mut() {
            *s /= peak;
        }
    }
}

fn remove_mean(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().map(|s| *s as f64).sum::<f64>() / samples.len() as f64;
    for s in samples.iter_mut() {
        *s = (*s as f64 - mean) as f32;
    }
}

/// Running sums over the recording: `sum[i]` and `energy[i]` cover `samples[..i]`.
struct Prefix {
    sum: Vec<f64>,
    energy: Vec<f64>,
}

impl Prefix {
    fn new(samples: &[f32]) -> Self {
        let mut sum = Vec::with_capacity(samples.len() + 1);
        let mut energy = Vec::with_capacity(samples.len() + 1);
        let (mut s1, mut s2) = (0.0f64, 0.0f64);
        sum.push(s1);
        energy.push(s2);
        for s in samples {
            let x = *s as f64;
            s1 += x;
            s2 += x * x;
            sum.push(s1);
            energy.push(s2);
        }
        Self { sum, energy }
    }

    /// Energy of `samples[start..start + n]` about its own mean.
    fn centered_energy(&self, start: usize, n: usize) -> f64 {
        let s1 = self.sum[start + n] - self.sum[start];
        let s2 = self.energy[start + n] - self.energy[start];
        (s2 - s1 * s1 / n as f64).max(0.0)
    }
}

fn ncc_at(recording: &[f32], prefix: &Prefix, template: &Template, start: usize) -> f32 {
    let n = template.samples.len();
    let segment_energy = prefix.centered_energy(start, n);
    if segment_energy <= ENERGY_FLOOR || template.energy <= ENERGY_FLOOR {
        return 0.0;
    }
    // The template sums to zero, so the segment's mean drops out of the dot product.
    let dot: f64 = template
        .samples
        .iter()
        .zip(&recording[start..start + n])
        .map(|(a, b)| *a as f64 * *b as f64)
        .sum();
    (dot.abs() / (template.energy * segment_energy).sqrt()).min(1.0) as f32
}

/// Zero-mean normalized cross-correlation over the common length:
/// `|Σ a'·b'| / sqrt(Σa'² · Σb'²)` with `a'`, `b'` mean-removed.
/// 0 when either side is constant.
pub fn normalized_cross_correlation(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a = a[..n].iter().map(|x| *x as f64).sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().map(|x| *x as f64).sum::<f64>() / n as f64;
    let (mut dot, mut ea, mut eb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..n {
        let (x, y) = (a[i] as f64 - mean_a, b[i] as f64 - mean_b);
        dot += x * y;
        ea += x * x;
        eb += y * y;
    }
    if ea <= ENERGY_FLOOR || eb <= ENERGY_FLOOR {
        return 0.0;
    }
    (dot.abs() / (ea * eb).sqrt()).min(1.0) as f32
}
