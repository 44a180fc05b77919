//! Turns raw per-marker matches into one latency value and a confidence score.

use crate::config::DetectorConfig;
use crate::measurement::{Detection, DetectionRole, LatencyMeasurement};
use airsync_shared_protocol::{CalibrationSignalSpec, MarkerKind, MarkerSpec};

const CORRELATION_WEIGHT: f64 = 0.5;
const SPREAD_WEIGHT: f64 = 0.3;
const COVERAGE_WEIGHT: f64 = 0.2;

/// A marker that cleared the correlation threshold.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub marker: &'a MarkerSpec,
    pub sample_index: usize,
    pub correlation: f32,
}

/// A chirp that actually sweeps or sits above the hum band.
fn is_sweep(marker: &MarkerSpec) -> bool {
    matches!(marker.kind, MarkerKind::Chirp { .. }) && !marker.is_hum()
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Flags values within `multiplier * MAD + epsilon` of the median.
pub fn mad_inliers(values: &[f64], multiplier: f64, epsilon: f64) -> Vec<bool> {
    let Some(center) = median(values) else {
        return Vec::new();
    };
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    let mad = median(&deviations).unwrap_or(0.0);
    let limit = multiplier * mad + epsilon;
    deviations.iter().map(|d| *d <= limit).collect()
}

pub fn aggregate(
    candidates: &[Candidate<'_>],
    spec: &CalibrationSignalSpec,
    start_offset_samples: i64,
    config: &DetectorConfig,
) -> LatencyMeasurement {
    if candidates.is_empty() {
        tracing::info!(markers = spec.markers.len(), "no markers detected");
        return LatencyMeasurement::empty();
    }
    // Clicks and hum are simple enough shapes that noise can resemble them;
    // only a sweep carries enough structure to vouch for the alignment.
    if !candidates.iter().any(|c| is_sweep(c.marker)) {
        tracing::info!(
            accepted = candidates.len(),
            "no sweep marker detected, discarding uncorroborated matches"
        );
        return LatencyMeasurement::empty();
    }

    let sr = spec.sample_rate.max(1) as f64;
    let to_ms = |samples: f64| samples / sr * 1000.0;
    let latency_of = |c: &Candidate<'_>| {
        let expected = c.marker.start_sample as f64 + start_offset_samples as f64;
        to_ms(c.sample_index as f64 - expected)
    };

    let anchor_start = spec.length_samples as f64 * config.anchor_fraction as f64;
    let anchors: Vec<bool> = candidates
        .iter()
        .map(|c| !c.marker.is_hum() && c.marker.start_sample as f64 >= anchor_start)
        .collect();
    let use_anchors = anchors.iter().any(|a| *a);
    let pool: Vec<usize> = (0..candidates.len())
        .filter(|&i| !use_anchors || anchors[i])
        .collect();

    // Implied playback start within the recording, one per pooled marker.
    let implied: Vec<f64> = pool
        .iter()
        .map(|&i| candidates[i].sample_index as f64 - candidates[i].marker.start_sample as f64)
        .collect();
    let inliers = mad_inliers(&implied, config.mad_multiplier, config.mad_epsilon_samples);

    let mut roles = vec![DetectionRole::Supporting; candidates.len()];
    let mut kept_offsets = Vec::with_capacity(pool.len());
    let mut kept_latencies = Vec::with_capacity(pool.len());
    let mut kept_correlations = Vec::with_capacity(pool.len());
    for (slot, &i) in pool.iter().enumerate() {
        let candidate = &candidates[i];
        if inliers[slot] {
            roles[i] = DetectionRole::Used;
            kept_offsets.push(implied[slot]);
            kept_latencies.push(latency_of(candidate));
            kept_correlations.push(candidate.correlation as f64);
        } else {
            roles[i] = DetectionRole::Outlier;
            tracing::debug!(
                marker = %candidate.marker.id,
                implied_start = implied[slot],
                "marker_rejected_as_outlier"
            );
        }
    }

    let consensus = median(&kept_offsets).unwrap_or(0.0);
    let mut latency_ms = to_ms(consensus - start_offset_samples as f64);
    if latency_ms < 0.0 && latency_ms >= -(config.negative_tolerance_ms as f64) {
        latency_ms = 0.0;
    }

    let confidence = score(
        &kept_correlations,
        &kept_latencies,
        candidates.len(),
        spec.markers.len(),
        config.spread_scale_ms as f64,
    );

    let detections = candidates
        .iter()
        .zip(anchors.iter().zip(roles))
        .map(|(c, (anchor, role))| Detection {
            marker_id: c.marker.id.clone(),
            sample_index: c.sample_index as u64,
            correlation: c.correlation,
            latency_ms: latency_of(c) as f32,
            anchor: *anchor,
            role,
        })
        .collect();

    tracing::info!(
        latency_ms = %format!("{:.2}", latency_ms),
        confidence = %format!("{:.3}", confidence),
        accepted = candidates.len(),
        used = kept_offsets.len(),
        anchors_only = use_anchors,
        "latency_aggregated"
    );

    LatencyMeasurement {
        latency_ms: latency_ms as f32,
        confidence,
        detections,
    }
}

fn score(
    correlations: &[f64],
    latencies_ms: &[f64],
    accepted: usize,
    total: usize,
    spread_scale_ms: f64,
) -> f32 {
    let spread = std_dev(latencies_ms);
    let spread_factor = 1.0 / (1.0 + spread / spread_scale_ms.max(1e-6));
    let coverage = accepted as f64 / total.max(1) as f64;

    let mut confidence = CORRELATION_WEIGHT * mean(correlations)
        + SPREAD_WEIGHT * spread_factor
        + COVERAGE_WEIGHT * coverage.min(1.0);
    // One marker cannot corroborate itself.
    if accepted < 2 {
        confidence *= 0.5;
    }
    confidence.clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn chirp(id: &str, start: u32) -> MarkerSpec {
        MarkerSpec {
            id: id.into(),
            kind: MarkerKind::Chirp {
                start_freq: 2_000,
                end_freq: 6_000,
                duration_ms: 50,
            },
            start_sample: start,
            duration_samples: 2_400,
        }
    }

    fn spec_with(markers: Vec<MarkerSpec>) -> CalibrationSignalSpec {
        CalibrationSignalSpec {
            sample_rate: 48_000,
            length_samples: 100_000,
            markers,
        }
    }

    fn candidates<'a>(spec: &'a CalibrationSignalSpec, offsets: &[i64]) -> Vec<Candidate<'a>> {
        spec.markers
            .iter()
            .zip(offsets)
            .map(|(m, off)| Candidate {
                marker: m,
                sample_index: (m.start_sample as i64 + off) as usize,
                correlation: 0.9,
            })
            .collect()
    }

    #[test]
    fn median_handles_odd_even_and_empty() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn mad_tolerates_zero_spread_and_drops_far_values() {
        assert_eq!(
            mad_inliers(&[10.0, 10.0, 11.0, 10.0], 3.5, 2.0),
            vec![true, true, true, true]
        );
        assert_eq!(
            mad_inliers(&[10.0, 11.0, 9.0, 10.0, 400.0], 3.5, 2.0),
            vec![true, true, true, true, false]
        );
    }

    #[test]
    fn outlier_marker_does_not_move_the_consensus() {
        let spec = spec_with(vec![
            chirp("a", 55_000),
            chirp("b", 65_000),
            chirp("c", 75_000),
            chirp("d", 85_000),
            chirp("e", 95_000),
        ]);
        let found = candidates(&spec, &[480, 481, 480, 479, 2_000]);
        let m = aggregate(&found, &spec, 0, &DetectorConfig::default());

        assert_abs_diff_eq!(m.latency_ms, 10.0, epsilon = 0.05);
        assert_eq!(m.detections[4].role, DetectionRole::Outlier);
        assert_eq!(m.used().count(), 4);
    }

    #[test]
    fn anchors_take_precedence_over_early_markers() {
        let spec = spec_with(vec![chirp("early", 1_000), chirp("late_1", 60_000), chirp("late_2", 80_000)]);
        let found = candidates(&spec, &[900, 480, 482]);
        let m = aggregate(&found, &spec, 0, &DetectorConfig::default());

        assert_abs_diff_eq!(m.latency_ms, 481.0 / 48.0, epsilon = 0.01);
        assert_eq!(m.detections[0].role, DetectionRole::Supporting);
        assert!(!m.detections[0].anchor);
        assert!(m.detections[1].anchor && m.detections[2].anchor);
    }

    #[test]
    fn falls_back_to_all_markers_without_anchors() {
        let spec = spec_with(vec![chirp("a", 1_000), chirp("b", 10_000), chirp("c", 20_000)]);
        let found = candidates(&spec, &[960, 960, 962]);
        let m = aggregate(&found, &spec, 0, &DetectorConfig::default());
        assert_abs_diff_eq!(m.latency_ms, 20.0, epsilon = 0.01);
        assert!(m.detections.iter().all(|d| d.role == DetectionRole::Used));
    }

    #[test]
    fn latency_is_relative_to_start_offset() {
        let spec = spec_with(vec![chirp("a", 1_000), chirp("b", 10_000)]);
        let found = candidates(&spec, &[96_000 + 1_440, 96_000 + 1_440]);
        let m = aggregate(&found, &spec, 96_000, &DetectorConfig::default());
        assert_abs_diff_eq!(m.latency_ms, 30.0, epsilon = 0.01);
        assert_abs_diff_eq!(m.detections[0].latency_ms, 30.0, epsilon = 0.01);
    }

    #[test]
    fn slight_negative_clamps_but_large_negative_survives() {
        let spec = spec_with(vec![chirp("a", 1_000), chirp("b", 10_000)]);
        let config = DetectorConfig::default();

        let found = candidates(&spec, &[-96, -96]);
        assert_eq!(aggregate(&found, &spec, 0, &config).latency_ms, 0.0);

        let found = candidates(&spec, &[-480, -480]);
        assert_abs_diff_eq!(aggregate(&found, &spec, 0, &config).latency_ms, -10.0, epsilon = 0.01);

        let strict = DetectorConfig {
            negative_tolerance_ms: 0.0,
            ..DetectorConfig::default()
        };
        let found = candidates(&spec, &[-96, -96]);
        assert_abs_diff_eq!(aggregate(&found, &spec, 0, &strict).latency_ms, -2.0, epsilon = 0.01);
    }

    #[test]
    fn confidence_drops_with_single_marker_and_spread() {
        let spec = spec_with(vec![chirp("a", 1_000), chirp("b", 10_000), chirp("c", 20_000)]);
        let config = DetectorConfig::default();

        let tight = aggregate(&candidates(&spec, &[480, 480, 480]), &spec, 0, &config);
        let spread = aggregate(&candidates(&spec, &[480, 700, 900]), &spec, 0, &config);
        let single = aggregate(&candidates(&spec, &[480]), &spec, 0, &config);

        assert!(tight.confidence > spread.confidence);
        assert!(tight.confidence > single.confidence);
        assert!(single.confidence <= 0.5);
        assert!((0.0..=1.0).contains(&tight.confidence));
    }

    fn click(id: &str, start: u32) -> MarkerSpec {
        MarkerSpec {
            id: id.into(),
            kind: MarkerKind::Click,
            start_sample: start,
            duration_samples: 480,
        }
    }

    fn hum(id: &str, start: u32) -> MarkerSpec {
        MarkerSpec {
            id: id.into(),
            kind: MarkerKind::Chirp {
                start_freq: 120,
                end_freq: 120,
                duration_ms: 400,
            },
            start_sample: start,
            duration_samples: 19_200,
        }
    }

    #[test]
    fn clicks_alone_are_not_a_measurement() {
        let spec = spec_with(vec![click("a", 10_000), click("b", 70_000), chirp("c", 80_000)]);
        let found = candidates(&spec, &[480, 480]);
        let m = aggregate(&found, &spec, 0, &DetectorConfig::default());
        assert_eq!(m, LatencyMeasurement::empty());

        let found = candidates(&spec, &[480, 480, 481]);
        let m = aggregate(&found, &spec, 0, &DetectorConfig::default());
        assert_eq!(m.detections.len(), 3);
        assert_abs_diff_eq!(m.latency_ms, 10.0, epsilon = 0.05);
    }

    #[test]
    fn hum_is_never_an_anchor() {
        let spec = spec_with(vec![chirp("early", 1_000), hum("late_hum", 70_000), chirp("late", 80_000)]);
        let found = candidates(&spec, &[480, 5_000, 480]);
        let m = aggregate(&found, &spec, 0, &DetectorConfig::default());

        assert!(!m.detections[1].anchor);
        assert_eq!(m.detections[1].role, DetectionRole::Supporting);
        assert!(m.detections[2].anchor);
        assert_abs_diff_eq!(m.latency_ms, 10.0, epsilon = 0.01);
    }

    #[test]
    fn no_candidates_gives_empty_measurement() {
        let spec = spec_with(vec![chirp("a", 1_000)]);
        let m = aggregate(&[], &spec, 0, &DetectorConfig::default());
        assert_eq!(m, LatencyMeasurement::empty());
    }
}
