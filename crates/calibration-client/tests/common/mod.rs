#![allow(dead_code)]

use airsync_calibration_client::recorder::emit_levels;
use airsync_calibration_client::{
    CalibrationConfig, CalibrationError, Capture, Clock, DetectorConfig, ReceiverApi,
    RecordedAudio, Recorder, RecordingRequest, Result,
};
use airsync_shared_protocol::synth::synthesize;
use airsync_shared_protocol::{
    CalibrationReady, CalibrationRequest, CalibrationSignalSpec, CalibrationSubmission,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SAMPLE_RATE: u32 = 48_000;

pub fn ms_to_samples(ms: f64) -> usize {
    (ms * SAMPLE_RATE as f64 / 1000.0).round() as usize
}

/// Short lead times and a narrow search window keep the tests quick.
pub fn fast_config() -> CalibrationConfig {
    CalibrationConfig {
        lead_time_ms: 200,
        safety_cushion_ms: 50,
        trailing_pad_ms: 200,
        clock_probe_count: 3,
        clock_probe_interval_ms: 0,
        detector: DetectorConfig {
            search_window_ms: 100,
            ..DetectorConfig::default()
        },
        ..CalibrationConfig::default()
    }
}

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn position(log: &EventLog, event: &str) -> Option<usize> {
    log.lock().unwrap().iter().position(|e| e == event)
}

pub fn count(log: &EventLog, event: &str) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == event).count()
}

pub struct FixedClock(pub f64);

impl Clock for FixedClock {
    fn now_ms(&self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fail {
    Nothing,
    Spec,
    Time,
    Request,
    Trigger,
    Submit,
}

pub struct MockReceiver {
    pub spec: CalibrationSignalSpec,
    pub server_time_ms: u64,
    pub fail: Fail,
    pub log: EventLog,
    pub requests: Mutex<Vec<CalibrationRequest>>,
    pub readies: Mutex<Vec<CalibrationReady>>,
    pub submissions: Mutex<Vec<CalibrationSubmission>>,
}

impl MockReceiver {
    pub fn new(spec: CalibrationSignalSpec, server_time_ms: u64, log: EventLog) -> Self {
        Self {
            spec,
            server_time_ms,
            fail: Fail::Nothing,
            log,
            requests: Mutex::new(Vec::new()),
            readies: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, event: &str, fail: Fail) -> Result<()> {
        self.log.lock().unwrap().push(event.to_string());
        if self.fail == fail {
            return Err(CalibrationError::Network(format!("{event} refused")));
        }
        Ok(())
    }
}

impl ReceiverApi for MockReceiver {
    async fn fetch_spec(&self) -> Result<CalibrationSignalSpec> {
        self.log.lock().unwrap().push("spec".into());
        if self.fail == Fail::Spec {
            return Err(CalibrationError::Decode("unknown variant `pulse`".into()));
        }
        Ok(self.spec.clone())
    }

    async fn server_time(&self) -> Result<u64> {
        self.record("time", Fail::Time)?;
        Ok(self.server_time_ms)
    }

    async fn request_playback(&self, request: &CalibrationRequest) -> Result<()> {
        self.record("request", Fail::Request)?;
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn trigger_playback(&self, ready: &CalibrationReady) -> Result<()> {
        self.record("ready", Fail::Trigger)?;
        self.readies.lock().unwrap().push(ready.clone());
        Ok(())
    }

    async fn submit_result(&self, submission: &CalibrationSubmission) -> Result<()> {
        self.record("submit", Fail::Submit)?;
        self.submissions.lock().unwrap().push(submission.clone());
        Ok(())
    }
}

/// Plays back `signal` into the "microphone" `lead_samples + delay_samples`
/// into the capture.
pub struct SimulatedRecorder {
    pub signal: Vec<f32>,
    pub started_at_ms: f64,
    pub lead_samples: usize,
    pub delay_samples: usize,
    pub permission: bool,
    /// Capture never completes on its own.
    pub hang: bool,
    /// How long a hanging capture takes to wind down after cancellation.
    pub drain: Duration,
    pub silent: bool,
    pub cancelled: Arc<AtomicBool>,
    pub log: EventLog,
}

impl SimulatedRecorder {
    pub fn new(spec: &CalibrationSignalSpec, started_at_ms: f64, log: EventLog) -> Self {
        Self {
            signal: synthesize(spec),
            started_at_ms,
            lead_samples: 0,
            delay_samples: 0,
            permission: true,
            hang: false,
            drain: Duration::ZERO,
            silent: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            log,
        }
    }
}

impl Recorder for SimulatedRecorder {
    async fn ensure_permission(&self) -> Result<()> {
        if self.permission {
            Ok(())
        } else {
            Err(CalibrationError::PermissionDenied)
        }
    }

    async fn start(&self, request: RecordingRequest) -> Result<Capture> {
        self.log.lock().unwrap().push("record_started".into());

        if self.hang {
            let cancelled = self.cancelled.clone();
            let drain = self.drain;
            return Ok(Capture::spawn(self.started_at_ms, move |cancel| async move {
                cancel.cancelled().await;
                tokio::time::sleep(drain).await;
                cancelled.store(true, Ordering::SeqCst);
                Err(CalibrationError::Cancelled)
            }));
        }

        let total = request.expected_samples();
        let mut samples = vec![0.0f32; total];
        if !self.silent {
            let at = self.lead_samples + self.delay_samples;
            for (slot, s) in samples.iter_mut().skip(at).zip(&self.signal) {
                *slot = *s * 0.5;
            }
        }
        let started_at_ms = self.started_at_ms;
        let sample_rate = request.session.sample_rate;
        let block = request.session.level_block_samples();
        let levels = request.levels;
        Ok(Capture::spawn(started_at_ms, move |_cancel| async move {
            if let Some(levels) = &levels {
                emit_levels(&samples, block, levels);
            }
            Ok(RecordedAudio {
                samples,
                sample_rate,
                started_at_ms,
            })
        }))
    }
}
