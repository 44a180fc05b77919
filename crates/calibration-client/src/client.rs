//! HTTP access to the receiver's calibration endpoints.

use crate::error::Result;
use airsync_shared_protocol::{
    CalibrationReady, CalibrationRequest, CalibrationSignalSpec, CalibrationSubmission,
    ServerTime, SpecResponse,
};
use std::future::Future;
use std::time::Duration;

/// The receiver as seen by a calibration session.
pub trait ReceiverApi: Send + Sync {
    fn fetch_spec(&self) -> impl Future<Output = Result<CalibrationSignalSpec>> + Send;

    /// Receiver wall clock in milliseconds.
    fn server_time(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Asks the receiver to prepare playback of the calibration signal.
    fn request_playback(
        &self,
        request: &CalibrationRequest,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Commits playback to start at `ready.target_start_ms` on the receiver clock.
    fn trigger_playback(&self, ready: &CalibrationReady)
        -> impl Future<Output = Result<()>> + Send;

    fn submit_result(
        &self,
        submission: &CalibrationSubmission,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpReceiverClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpReceiverClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl ReceiverApi for HttpReceiverClient {
    async fn fetch_spec(&self) -> Result<CalibrationSignalSpec> {
        let body = self
            .http
            .get(self.url("/calibration/spec"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let spec = SpecResponse::decode(&body)?;
        tracing::debug!(
            markers = spec.markers.len(),
            sample_rate = spec.sample_rate,
            length = spec.length_samples,
            "fetched signal spec"
        );
        Ok(spec)
    }

    async fn server_time(&self) -> Result<u64> {
        let time: ServerTime = self
            .http
            .get(self.url("/time"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(time.server_time_ms)
    }

    async fn request_playback(&self, request: &CalibrationRequest) -> Result<()> {
        self.http
            .post(self.url("/calibration/request"))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn trigger_playback(&self, ready: &CalibrationReady) -> Result<()> {
        self.http
            .post(self.url("/calibration/ready"))
            .json(ready)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn submit_result(&self, submission: &CalibrationSubmission) -> Result<()> {
        self.http
            .post(self.url("/calibration/result"))
            .json(submission)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
