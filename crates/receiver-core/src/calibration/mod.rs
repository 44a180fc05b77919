use airsync_shared_protocol::CalibrationSubmission;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod signal;

pub trait ConfigWriter {
    fn write(&self, contents: &str) -> Result<()>;
}

/// Restarts whatever plays audio so a new offset takes effect.
pub trait PipelineController {
    fn restart(&self) -> Result<()>;
}

pub struct FileConfigWriter {
    path: PathBuf,
}

impl FileConfigWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigWriter for FileConfigWriter {
    fn write(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, contents)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

/// Runs an external command, e.g. `systemctl restart shairport-sync`.
pub struct CommandPipelineController {
    command: Vec<String>,
}

impl CommandPipelineController {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl PipelineController for CommandPipelineController {
    fn restart(&self) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            tracing::info!("pipeline restart disabled");
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("spawning {program}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("{program} exited with {status}"))
        }
    }
}

/// What the receiver persists after applying a calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCalibration {
    pub measured_latency_ms: f32,
    pub applied_offset_ms: f32,
    pub was_clamped: bool,
    pub confidence: f32,
    pub applied_at_ms: u64,
}

impl AppliedCalibration {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

pub struct CalibrationOutcome {
    pub measured_latency_ms: f32,
    pub applied_offset_ms: f32,
    pub was_clamped: bool,
}

pub struct CalibrationApplier<W: ConfigWriter, C: PipelineController> {
    writer: W,
    controller: C,
    limit_ms: f32,
    force_latency_ms: Option<f32>,
}

impl<W: ConfigWriter, C: PipelineController> CalibrationApplier<W, C> {
    pub fn new(writer: W, controller: C) -> Self {
        Self {
            writer,
            controller,
            limit_ms: 250.0,
            force_latency_ms: None,
        }
    }

    pub fn with_limit_ms(mut self, limit_ms: f32) -> Self {
        self.limit_ms = limit_ms.abs();
        self
    }

    pub fn with_forced_latency(mut self, latency_ms: Option<f32>) -> Self {
        self.force_latency_ms = latency_ms;
        self
    }

    pub fn apply_latency(&self, measured_latency_ms: f32, confidence: f32) -> Result<CalibrationOutcome> {
        let effective_latency_ms = self.force_latency_ms.unwrap_or(measured_latency_ms);
        if let Some(forced) = self.force_latency_ms {
            tracing::info!(forced_ms = forced, measured_ms = measured_latency_ms, "applying forced latency");
        }

        let clamped_latency_ms = effective_latency_ms.clamp(-self.limit_ms, self.limit_ms);
        // Late audio is compensated by starting output earlier.
        let applied_offset_ms = -clamped_latency_ms;
        let applied = AppliedCalibration {
            measured_latency_ms: effective_latency_ms,
            applied_offset_ms,
            was_clamped: clamped_latency_ms != effective_latency_ms,
            confidence,
            applied_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };

        self.writer.write(&serde_json::to_string_pretty(&applied)?)?;
        if let Err(e) = self.controller.restart() {
            tracing::warn!(error = %e, "pipeline restart failed (ignored)");
        }

        tracing::info!(
            measured_ms = effective_latency_ms,
            offset_ms = applied_offset_ms,
            clamped = applied.was_clamped,
            "calibration applied"
        );
        Ok(CalibrationOutcome {
            measured_latency_ms: effective_latency_ms,
            applied_offset_ms,
            was_clamped: applied.was_clamped,
        })
    }

    pub fn apply_submission(&self, submission: &CalibrationSubmission) -> Result<CalibrationOutcome> {
        self.apply_latency(submission.latency_ms, submission.confidence)
    }
}
