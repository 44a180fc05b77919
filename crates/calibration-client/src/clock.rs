//! Client/receiver clock offset estimation.
//!
//! Each probe records the local send time `t0`, the receiver's reported time
//! `t1` and the local receive time `t2`. Assuming a symmetric path, the
//! receiver was `t1 - (t0 + t2) / 2` ms ahead of us. The estimate is the
//! median over all probes so a single slow round trip cannot skew it.

use crate::client::ReceiverApi;
use crate::config::CalibrationConfig;
use crate::error::{CalibrationError, Result};
use crate::scoring::median;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Local wall clock in fractional milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub sent_ms: f64,
    pub server_ms: f64,
    pub received_ms: f64,
}

impl ClockSample {
    pub fn offset_ms(&self) -> f64 {
        self.server_ms - (self.sent_ms + self.received_ms) / 2.0
    }

    pub fn round_trip_ms(&self) -> f64 {
        self.received_ms - self.sent_ms
    }
}

pub fn median_offset(samples: &[ClockSample]) -> Option<f64> {
    let offsets: Vec<f64> = samples.iter().map(ClockSample::offset_ms).collect();
    median(&offsets)
}

pub fn mean_offset(samples: &[ClockSample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().map(ClockSample::offset_ms).sum::<f64>() / samples.len() as f64)
}

#[derive(Debug, Clone)]
pub struct ClockOffsetEstimator {
    probes: usize,
    interval: Duration,
}

impl ClockOffsetEstimator {
    pub fn new(probes: usize, interval: Duration) -> Self {
        Self {
            probes: probes.max(2),
            interval,
        }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new(config.clock_probe_count, config.clock_probe_interval())
    }

    pub fn probes(&self) -> usize {
        self.probes
    }

    /// Milliseconds to add to a local timestamp to express it on the receiver clock.
    ///
    /// Any failed probe fails the whole estimate.
    pub async fn estimate<A, C>(&self, api: &A, clock: &C) -> Result<f64>
    where
        A: ReceiverApi,
        C: Clock,
    {
        let mut samples = Vec::with_capacity(self.probes);
        for i in 0..self.probes {
            if i > 0 && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            let sent_ms = clock.now_ms();
            let server_ms = api.server_time().await? as f64;
            let received_ms = clock.now_ms();
            let sample = ClockSample {
                sent_ms,
                server_ms,
                received_ms,
            };
            tracing::trace!(
                probe = i,
                offset_ms = sample.offset_ms(),
                rtt_ms = sample.round_trip_ms(),
                "clock probe"
            );
            samples.push(sample);
        }

        let offset = median_offset(&samples)
            .ok_or_else(|| CalibrationError::Internal("no clock samples".to_string()))?;
        tracing::debug!(
            offset_ms = %format!("{:.1}", offset),
            probes = samples.len(),
            "clock offset estimated"
        );
        Ok(offset)
    }
}
