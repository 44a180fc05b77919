//! Two-phase playback scheduling: `arm` picks the signal, `commit` fixes the
//! start instant on the receiver clock.

use crate::calibration::signal::{generate_legacy_signal, StructuredSignal};
use airsync_shared_protocol::CalibrationRequest;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub trait ReceiverClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemReceiverClock;

impl ReceiverClock for SystemReceiverClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("playback was not armed")]
    NotArmed,
    #[error("could not prepare signal: {0}")]
    Prepare(String),
}

/// What a committed playback will play.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmedPlayback {
    pub path: PathBuf,
    pub structured: bool,
    pub delay_ms: u32,
}

pub trait PlaybackScheduler {
    fn arm(&self, request: &CalibrationRequest) -> Result<ArmedPlayback, PlaybackError>;

    /// Starts the armed signal at `target_start_ms`. Consumes the arm.
    fn commit(&self, target_start_ms: u64) -> Result<ArmedPlayback, PlaybackError>;
}

/// Plays WAV files through an external player at the committed instant.
pub struct CommandPlayback {
    signal: StructuredSignal,
    legacy_path: PathBuf,
    command: Vec<String>,
    clock: Arc<dyn ReceiverClock>,
    armed: Mutex<Option<ArmedPlayback>>,
}

impl CommandPlayback {
    pub fn new(
        signal: StructuredSignal,
        legacy_path: PathBuf,
        command: Vec<String>,
        clock: Arc<dyn ReceiverClock>,
    ) -> Self {
        Self {
            signal,
            legacy_path,
            command,
            clock,
            armed: Mutex::new(None),
        }
    }

    fn armed(&self) -> std::sync::MutexGuard<'_, Option<ArmedPlayback>> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PlaybackScheduler for CommandPlayback {
    fn arm(&self, request: &CalibrationRequest) -> Result<ArmedPlayback, PlaybackError> {
        let path = if request.structured {
            self.signal.path.clone()
        } else {
            let config = request.chirp_config.clone().unwrap_or_default();
            generate_legacy_signal(&config, self.signal.spec.sample_rate, &self.legacy_path)
                .map_err(|e| PlaybackError::Prepare(format!("{e:#}")))?
        };
        let armed = ArmedPlayback {
            path,
            structured: request.structured,
            delay_ms: request.delay_ms,
        };
        tracing::info!(
            structured = armed.structured,
            delay_ms = armed.delay_ms,
            path = %armed.path.display(),
            "playback armed"
        );
        *self.armed() = Some(armed.clone());
        Ok(armed)
    }

    fn commit(&self, target_start_ms: u64) -> Result<ArmedPlayback, PlaybackError> {
        let armed = self.armed().take().ok_or(PlaybackError::NotArmed)?;

        let now = self.clock.now_ms();
        let wait = Duration::from_millis(target_start_ms.saturating_sub(now));
        if target_start_ms < now {
            tracing::warn!(late_ms = now - target_start_ms, "playback target already passed, starting now");
        }

        let command = self.command.clone();
        let path = armed.path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            run_player(&command, &path).await;
        });
        tracing::info!(target_start_ms, wait_ms = wait.as_millis() as u64, "playback committed");
        Ok(armed)
    }
}

async fn run_player(command: &[String], path: &std::path::Path) {
    let Some((program, args)) = command.split_first() else {
        tracing::warn!("no playback command configured");
        return;
    };
    let status = tokio::process::Command::new(program)
        .args(args)
        .arg(path)
        .status()
        .await;
    match status {
        Ok(status) if status.success() => tracing::debug!(path = %path.display(), "playback finished"),
        Ok(status) => tracing::error!(%status, program = %program, "player exited with failure"),
        Err(e) => tracing::error!(error = %e, program = %program, "failed to start player"),
    }
}
