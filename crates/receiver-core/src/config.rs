use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub bind_addr: SocketAddr,
    /// Where the structured calibration signal is rendered at startup.
    pub signal_path: PathBuf,
    /// Where legacy repeated-chirp signals are rendered on demand.
    pub legacy_signal_path: PathBuf,
    pub applied_calibration_path: PathBuf,
    /// Player program and arguments; the WAV path is appended.
    pub playback_command: Vec<String>,
    /// Run after a calibration is applied. Empty disables the restart.
    pub restart_command: Vec<String>,
    /// Applied latency is clamped to `±apply_limit_ms`.
    pub apply_limit_ms: f32,
    /// Applied instead of the measured latency when set.
    pub force_latency_ms: Option<f32>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            signal_path: PathBuf::from("/var/lib/airsync/calibration.wav"),
            legacy_signal_path: PathBuf::from("/var/lib/airsync/calibration-legacy.wav"),
            applied_calibration_path: PathBuf::from("/var/lib/airsync/applied-calibration.json"),
            playback_command: vec!["aplay".to_string(), "-q".to_string()],
            restart_command: vec![
                "/usr/bin/systemctl".to_string(),
                "restart".to_string(),
                "shairport-sync".to_string(),
            ],
            apply_limit_ms: 250.0,
            force_latency_ms: None,
        }
    }
}

impl ReceiverConfig {
    /// Reads a JSON config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no receiver config found, using defaults");
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        let config = serde_json::from_slice(&bytes)?;
        tracing::info!(path = %path.display(), "loaded receiver config");
        Ok(config)
    }

    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("AIRSYNC_BIND_ADDR") {
            match addr.parse() {
                Ok(addr) => self.bind_addr = addr,
                Err(_) => tracing::warn!(value = %addr, "ignoring invalid AIRSYNC_BIND_ADDR"),
            }
        }
        if let Some(path) = lookup("AIRSYNC_SIGNAL_PATH") {
            self.signal_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("AIRSYNC_APPLIED_CALIBRATION_PATH") {
            self.applied_calibration_path = PathBuf::from(path);
        }
        if let Some(cmd) = lookup("AIRSYNC_PLAYBACK_COMMAND") {
            self.playback_command = cmd.split_whitespace().map(String::from).collect();
        }
        if lookup("AIRSYNC_SKIP_RESTART")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            self.restart_command.clear();
        }
        if let Some(raw) = lookup("AIRSYNC_FORCE_LATENCY_MS") {
            match raw.trim().parse::<f32>() {
                Ok(latency) => self.force_latency_ms = Some(latency),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid AIRSYNC_FORCE_LATENCY_MS"),
            }
        }
        self
    }
}
