//! Session and detector configuration.
//!
//! Loaded from JSON with per-field defaults, then overridden from `AIRSYNC_*`
//! environment variables.

use crate::recorder::AudioSessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Markers whose best NCC falls below this are discarded.
    pub min_correlation: f32,
    /// Half-width of the search window around each expected marker position.
    pub search_window_ms: u32,
    pub coarse_stride: usize,
    pub refine_radius: usize,
    pub mad_multiplier: f64,
    pub mad_epsilon_samples: f64,
    /// Negative results no lower than `-negative_tolerance_ms` are reported as zero.
    pub negative_tolerance_ms: f32,
    /// Non-hum markers starting past this fraction of the signal are anchors.
    pub anchor_fraction: f32,
    /// Latency spread at which the spread factor of the confidence halves.
    pub spread_scale_ms: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_correlation: 0.25,
            search_window_ms: 500,
            coarse_stride: 4,
            refine_radius: 16,
            mad_multiplier: 3.5,
            mad_epsilon_samples: 2.0,
            negative_tolerance_ms: 5.0,
            anchor_fraction: 0.5,
            spread_scale_ms: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub receiver_url: String,
    pub lead_time_ms: u32,
    pub safety_cushion_ms: u32,
    pub trailing_pad_ms: u32,
    pub clock_probe_count: usize,
    pub clock_probe_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub level_block_ms: u32,
    pub detector: DetectorConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            receiver_url: "http://127.0.0.1:5000".to_string(),
            lead_time_ms: 2_000,
            safety_cushion_ms: 250,
            trailing_pad_ms: 1_000,
            clock_probe_count: 5,
            clock_probe_interval_ms: 40,
            request_timeout_ms: 5_000,
            level_block_ms: 50,
            detector: DetectorConfig::default(),
        }
    }
}

impl CalibrationConfig {
    /// Reads a JSON config file, falling back to defaults on any error.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded calibration config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse calibration config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "no calibration config found, using defaults");
                Self::default()
            }
        }
    }

    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("AIRSYNC_RECEIVER_URL") {
            self.receiver_url = url;
        }
        if let Some(lead) = parse_var(&lookup, "AIRSYNC_LEAD_TIME_MS") {
            self.lead_time_ms = lead;
        }
        if let Some(min) = parse_var(&lookup, "AIRSYNC_MIN_CORRELATION") {
            self.detector.min_correlation = min;
        }
        if let Some(tol) = parse_var(&lookup, "AIRSYNC_NEGATIVE_TOLERANCE_MS") {
            self.detector.negative_tolerance_ms = tol;
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn clock_probe_interval(&self) -> Duration {
        Duration::from_millis(self.clock_probe_interval_ms)
    }

    pub fn audio_session(&self, sample_rate: u32) -> AudioSessionConfig {
        AudioSessionConfig {
            sample_rate,
            channels: 1,
            level_block_ms: self.level_block_ms,
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}
