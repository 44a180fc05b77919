//! Recording collaborator interface.
//!
//! A [`Recorder`] starts an owned capture task and hands back a [`Capture`].
//! The task owns its sample buffer until it completes, then the buffer moves
//! to whoever awaits [`Capture::finish`]. Live input levels travel on an
//! optional side channel.

use crate::error::{CalibrationError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long [`Capture::release`] waits for a cancelled task to wind down.
pub const RELEASE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSessionConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Window length for each reported RMS level.
    pub level_block_ms: u32,
}

impl AudioSessionConfig {
    pub fn level_block_samples(&self) -> usize {
        ((self.level_block_ms as u64 * self.sample_rate as u64) / 1000).max(1) as usize
    }
}

#[derive(Debug)]
pub struct RecordingRequest {
    pub duration: Duration,
    pub session: AudioSessionConfig,
    pub levels: Option<mpsc::UnboundedSender<f32>>,
}

impl RecordingRequest {
    pub fn expected_samples(&self) -> usize {
        (self.duration.as_secs_f64() * self.session.sample_rate as f64).round() as usize
    }
}

/// A finished mono capture.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Local wall clock of the first captured sample.
    pub started_at_ms: f64,
}

pub trait Recorder: Send + Sync {
    /// Resolves to `PermissionDenied` when the microphone is unavailable to us.
    fn ensure_permission(&self) -> impl Future<Output = Result<()>> + Send;

    /// Starts capturing. The returned [`Capture`] must already be recording.
    fn start(&self, request: RecordingRequest) -> impl Future<Output = Result<Capture>> + Send;
}

/// Owner side of a cooperative cancellation flag.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`CancellationHandle`].
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Pends forever if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// An in-flight recording task.
///
/// Dropping an unfinished capture cancels it.
#[derive(Debug)]
pub struct Capture {
    started_at_ms: f64,
    cancel: CancellationHandle,
    task: Option<JoinHandle<Result<RecordedAudio>>>,
}

impl Capture {
    /// Spawns `run` as the capture task. `run` receives the task's cancel
    /// signal and must stop promptly once it fires.
    pub fn spawn<F, Fut>(started_at_ms: f64, run: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<RecordedAudio>> + Send + 'static,
    {
        let cancel = CancellationHandle::new();
        let task = tokio::spawn(run(cancel.signal()));
        Self {
            started_at_ms,
            cancel,
            task: Some(task),
        }
    }

    pub fn started_at_ms(&self) -> f64 {
        self.started_at_ms
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the task and takes ownership of the recording.
    pub async fn finish(mut self) -> Result<RecordedAudio> {
        self.join().await
    }

    /// Waits for the task without consuming the capture.
    ///
    /// Cancel safe: if this future is dropped early the task is still owned
    /// here, so dropping or releasing the capture still stops it.
    pub async fn join(&mut self) -> Result<RecordedAudio> {
        let Some(task) = self.task.as_mut() else {
            return Err(CalibrationError::Internal("capture already finished".into()));
        };
        let outcome = task.await;
        self.task = None;
        match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(CalibrationError::Cancelled),
            Err(e) => Err(CalibrationError::Capture(format!("capture task failed: {e}"))),
        }
    }

    /// Cancels the task and waits until it has stopped, discarding whatever
    /// it recorded. A task that ignores its signal for longer than
    /// [`RELEASE_GRACE`] is aborted.
    pub async fn release(mut self) {
        let Some(task) = self.task.as_mut() else {
            return;
        };
        self.cancel.cancel();
        if tokio::time::timeout(RELEASE_GRACE, &mut *task).await.is_err() {
            tracing::warn!(grace_ms = RELEASE_GRACE.as_millis() as u64, "capture ignored cancellation, aborting");
            task.abort();
            let _ = (&mut *task).await;
        }
        self.task = None;
        tracing::debug!("capture released");
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                tracing::debug!("capture dropped before completion, cancelling");
                self.cancel.cancel();
            }
        }
    }
}

/// Root-mean-square of one block.
pub fn rms_level(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f64 = block.iter().map(|s| *s as f64 * *s as f64).sum();
    (sum / block.len() as f64).sqrt() as f32
}

/// Sends one RMS level per `block` samples. Stops quietly once the receiver is gone.
pub fn emit_levels(samples: &[f32], block: usize, levels: &mpsc::UnboundedSender<f32>) {
    for chunk in samples.chunks(block.max(1)) {
        if levels.send(rms_level(chunk)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rms_of_square_wave_is_its_amplitude() {
        let block: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        assert_abs_diff_eq!(rms_level(&block), 0.5, epsilon = 1e-6);
        assert_eq!(rms_level(&[]), 0.0);
    }

    #[test]
    fn levels_are_emitted_per_block() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        emit_levels(&vec![0.25; 250], 100, &tx);
        let mut levels = Vec::new();
        while let Ok(level) = rx.try_recv() {
            levels.push(level);
        }
        assert_eq!(levels.len(), 3);
        assert!(levels.iter().all(|l| (l - 0.25).abs() < 1e-6));
    }

    #[test]
    fn session_block_size_follows_sample_rate() {
        let session = AudioSessionConfig {
            sample_rate: 48_000,
            channels: 1,
            level_block_ms: 50,
        };
        assert_eq!(session.level_block_samples(), 2_400);
        let request = RecordingRequest {
            duration: Duration::from_millis(1_500),
            session,
            levels: None,
        };
        assert_eq!(request.expected_samples(), 72_000);
    }

    #[tokio::test]
    async fn cancel_signal_fires_once() {
        let handle = CancellationHandle::new();
        let signal = handle.signal();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        handle.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn never_signal_stays_pending() {
        let signal = CancelSignal::never();
        let result =
            tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn capture_hands_over_its_buffer() {
        let capture = Capture::spawn(1_000.0, |_cancel| async move {
            Ok(RecordedAudio {
                samples: vec![0.1; 480],
                sample_rate: 48_000,
                started_at_ms: 1_000.0,
            })
        });
        assert_eq!(capture.started_at_ms(), 1_000.0);
        let audio = capture.finish().await.unwrap();
        assert_eq!(audio.samples.len(), 480);
    }

    #[tokio::test]
    async fn dropping_a_capture_cancels_its_task() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let capture = Capture::spawn(0.0, |cancel| async move {
            cancel.cancelled().await;
            let _ = done_tx.send(());
            Err(CalibrationError::Cancelled)
        });
        drop(capture);
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_a_pending_join_still_cancels_on_drop() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut capture = Capture::spawn(0.0, |cancel| async move {
            cancel.cancelled().await;
            let _ = done_tx.send(());
            Err(CalibrationError::Cancelled)
        });
        let waited = tokio::time::timeout(Duration::from_millis(20), capture.join()).await;
        assert!(waited.is_err());
        drop(capture);
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn release_waits_for_the_task_to_stop() {
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let capture = Capture::spawn(0.0, {
            let stopped = stopped.clone();
            move |cancel| async move {
                cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                stopped.store(true, std::sync::atomic::Ordering::SeqCst);
                Err(CalibrationError::Cancelled)
            }
        });
        capture.release().await;
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn explicit_cancel_surfaces_through_finish() {
        let capture = Capture::spawn(0.0, |cancel| async move {
            cancel.cancelled().await;
            Err(CalibrationError::Cancelled)
        });
        capture.cancel();
        assert_eq!(capture.finish().await, Err(CalibrationError::Cancelled));
    }
}
