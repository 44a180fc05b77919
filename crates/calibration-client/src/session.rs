//! One-shot calibration session.
//!
//! Drives the receiver and the recorder through
//! `Idle → RequestingPlayback → Recording → Calculating → Sending → Completed`,
//! publishing every transition. Any collaborator error or cancellation ends
//! the session in `Failed`, after the in-flight capture has been stopped.

use crate::client::{HttpReceiverClient, ReceiverApi};
use crate::clock::{Clock, ClockOffsetEstimator, SystemClock};
use crate::config::CalibrationConfig;
use crate::detector::MarkerDetector;
use crate::error::{CalibrationError, Result};
use crate::measurement::LatencyMeasurement;
use crate::recorder::{CancelSignal, Recorder, RecordingRequest};
use airsync_shared_protocol::{CalibrationReady, CalibrationRequest, CalibrationSignalSpec};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStage {
    Idle,
    RequestingPlayback,
    Recording,
    Calculating,
    Sending,
    Completed(LatencyMeasurement),
    Failed(String),
}

impl CalibrationStage {
    fn ordinal(&self) -> u8 {
        match self {
            CalibrationStage::Idle => 0,
            CalibrationStage::RequestingPlayback => 1,
            CalibrationStage::Recording => 2,
            CalibrationStage::Calculating => 3,
            CalibrationStage::Sending => 4,
            CalibrationStage::Completed(_) => 5,
            CalibrationStage::Failed(_) => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CalibrationStage::Idle => "idle",
            CalibrationStage::RequestingPlayback => "requesting_playback",
            CalibrationStage::Recording => "recording",
            CalibrationStage::Calculating => "calculating",
            CalibrationStage::Sending => "sending",
            CalibrationStage::Completed(_) => "completed",
            CalibrationStage::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CalibrationStage::Completed(_) | CalibrationStage::Failed(_)
        )
    }

    /// Stages only move one step forward; `Failed` is reachable from any
    /// non-terminal stage.
    pub fn can_advance_to(&self, next: &CalibrationStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            CalibrationStage::Failed(_) => true,
            _ => next.ordinal() == self.ordinal() + 1,
        }
    }
}

/// Playback timing fixed before recording starts.
struct Schedule {
    spec: CalibrationSignalSpec,
    /// Local instant the signal's first sample should reach the microphone,
    /// ignoring acoustic latency.
    client_target_ms: f64,
    target_start_ms: u64,
}

async fn until_cancelled<T>(
    cancel: &CancelSignal,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CalibrationError::Cancelled),
        result = work => result,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub stage: CalibrationStage,
    /// Local wall clock at the transition.
    pub at_ms: f64,
}

pub struct CalibrationSession<A, R, C = SystemClock> {
    api: A,
    recorder: R,
    clock: C,
    config: CalibrationConfig,
    detector: Arc<MarkerDetector>,
    stage_tx: watch::Sender<StageEvent>,
    history: Mutex<Vec<StageEvent>>,
    level_sink: Option<mpsc::UnboundedSender<f32>>,
    started: AtomicBool,
}

impl<R: Recorder> CalibrationSession<HttpReceiverClient, R, SystemClock> {
    /// Session talking HTTP to `config.receiver_url` on the system clock.
    pub fn over_http(config: CalibrationConfig, recorder: R) -> Result<Self> {
        let api = HttpReceiverClient::new(&config.receiver_url, config.request_timeout())?;
        Ok(Self::new(api, recorder, SystemClock, config))
    }
}

impl<A, R, C> CalibrationSession<A, R, C>
where
    A: ReceiverApi,
    R: Recorder,
    C: Clock,
{
    pub fn new(api: A, recorder: R, clock: C, config: CalibrationConfig) -> Self {
        let detector = Arc::new(MarkerDetector::new(config.detector.clone()));
        let initial = StageEvent {
            stage: CalibrationStage::Idle,
            at_ms: clock.now_ms(),
        };
        let (stage_tx, _) = watch::channel(initial.clone());
        Self {
            api,
            recorder,
            clock,
            config,
            detector,
            stage_tx,
            history: Mutex::new(vec![initial]),
            level_sink: None,
            started: AtomicBool::new(false),
        }
    }

    /// Forwards the recorder's live RMS levels to `sink`.
    pub fn with_level_sink(mut self, sink: mpsc::UnboundedSender<f32>) -> Self {
        self.level_sink = Some(sink);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<StageEvent> {
        self.stage_tx.subscribe()
    }

    pub fn stage(&self) -> CalibrationStage {
        self.stage_tx.borrow().stage.clone()
    }

    pub fn history(&self) -> Vec<StageEvent> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    /// Runs the session to completion. A session runs at most once.
    ///
    /// Cancellation and failures release the capture before the session
    /// reports `Failed`.
    pub async fn run(&self, cancel: CancelSignal) -> Result<LatencyMeasurement> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CalibrationError::AlreadyRan);
        }

        match self.execute(&cancel).await {
            Ok(measurement) => {
                self.advance(CalibrationStage::Completed(measurement.clone()))?;
                tracing::info!(
                    latency_ms = %format!("{:.2}", measurement.latency_ms),
                    confidence = %format!("{:.3}", measurement.confidence),
                    quality = ?measurement.quality(),
                    "calibration completed"
                );
                Ok(measurement)
            }
            Err(e) => {
                tracing::warn!(error = %e, stage = self.stage().name(), "calibration failed");
                self.advance(CalibrationStage::Failed(e.to_string()))?;
                Err(e)
            }
        }
    }

    async fn execute(&self, cancel: &CancelSignal) -> Result<LatencyMeasurement> {
        self.advance(CalibrationStage::RequestingPlayback)?;
        let schedule = until_cancelled(cancel, self.schedule()).await?;

        self.advance(CalibrationStage::Recording)?;
        let duration = Duration::from_millis(
            self.config.lead_time_ms as u64
                + self.config.safety_cushion_ms as u64
                + schedule.spec.duration_ms()
                + self.config.trailing_pad_ms as u64,
        );
        let mut capture = until_cancelled(
            cancel,
            self.recorder.start(RecordingRequest {
                duration,
                session: self.config.audio_session(schedule.spec.sample_rate),
                levels: self.level_sink.clone(),
            }),
        )
        .await?;
        tracing::debug!(
            duration_ms = duration.as_millis() as u64,
            target_start_ms = schedule.target_start_ms,
            "capture started, triggering playback"
        );

        let ready = CalibrationReady {
            timestamp: self.timestamp(),
            target_start_ms: schedule.target_start_ms,
        };
        let recorded = until_cancelled(cancel, async {
            self.api.trigger_playback(&ready).await?;
            capture.join().await
        })
        .await;
        let audio = match recorded {
            Ok(audio) => audio,
            Err(e) => {
                capture.release().await;
                return Err(e);
            }
        };
        if audio.sample_rate != schedule.spec.sample_rate {
            return Err(CalibrationError::Capture(format!(
                "recorded at {} Hz, signal is {} Hz",
                audio.sample_rate, schedule.spec.sample_rate
            )));
        }

        self.advance(CalibrationStage::Calculating)?;
        let start_offset_samples = ((schedule.client_target_ms - audio.started_at_ms)
            * schedule.spec.sample_rate as f64
            / 1000.0)
            .round() as i64;
        let detector = self.detector.clone();
        let spec = schedule.spec;
        let detection = tokio::task::spawn_blocking(move || {
            detector.detect(&audio.samples, &spec, start_offset_samples)
        });
        let measurement = until_cancelled(cancel, async {
            detection
                .await
                .map_err(|e| CalibrationError::Internal(format!("detector task failed: {e}")))
        })
        .await?;

        self.advance(CalibrationStage::Sending)?;
        until_cancelled(
            cancel,
            self.api.submit_result(&measurement.to_submission(self.timestamp())),
        )
        .await?;
        Ok(measurement)
    }

    /// Fetches the signal, estimates the clock offset and arms playback.
    async fn schedule(&self) -> Result<Schedule> {
        self.recorder.ensure_permission().await?;
        let spec = self.api.fetch_spec().await?;

        let offset_ms = match ClockOffsetEstimator::from_config(&self.config)
            .estimate(&self.api, &self.clock)
            .await
        {
            Ok(offset) => offset,
            Err(e) => {
                tracing::warn!(error = %e, "clock offset unavailable, assuming clocks agree");
                0.0
            }
        };

        let lead_ms = self.config.lead_time_ms;
        self.api
            .request_playback(&CalibrationRequest {
                timestamp: self.timestamp(),
                chirp_config: None,
                delay_ms: lead_ms,
                structured: true,
            })
            .await?;

        // Computed once; both the trigger and the detector's expected
        // alignment derive from this instant.
        let client_target_ms =
            self.clock.now_ms() + lead_ms as f64 + self.config.safety_cushion_ms as f64;
        let target_start_ms = (client_target_ms + offset_ms).round().max(0.0) as u64;
        tracing::debug!(offset_ms = %format!("{:.1}", offset_ms), target_start_ms, "playback armed");

        Ok(Schedule {
            spec,
            client_target_ms,
            target_start_ms,
        })
    }

    fn timestamp(&self) -> u64 {
        self.clock.now_ms().max(0.0) as u64
    }

    fn advance(&self, next: CalibrationStage) -> Result<()> {
        let current = self.stage();
        if !current.can_advance_to(&next) {
            return Err(CalibrationError::Internal(format!(
                "illegal stage transition {} -> {}",
                current.name(),
                next.name()
            )));
        }
        tracing::debug!(from = current.name(), to = next.name(), "stage transition");

        let event = StageEvent {
            stage: next,
            at_ms: self.clock.now_ms(),
        };
        if let Ok(mut history) = self.history.lock() {
            history.push(event.clone());
        }
        self.stage_tx.send_replace(event);
        Ok(())
    }
}
