use std::net::SocketAddr;
use std::sync::Arc;

use crate::calibration::{CalibrationApplier, ConfigWriter, PipelineController};
use crate::playback::{PlaybackError, PlaybackScheduler, ReceiverClock};
use airsync_shared_protocol::{
    CalibrationReady, CalibrationRequest, CalibrationSignalSpec, CalibrationSubmission,
    ServerTime, SpecResponse,
};
use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationApplyResponse {
    pub measured_latency_ms: f32,
    pub applied_offset_ms: f32,
    pub was_clamped: bool,
}

#[derive(Clone)]
pub struct ReceiverState {
    spec: Arc<CalibrationSignalSpec>,
    playback: Arc<dyn PlaybackScheduler + Send + Sync>,
    calibration: Arc<dyn CalibrationSink + Send + Sync>,
    clock: Arc<dyn ReceiverClock>,
}

impl ReceiverState {
    pub fn new(
        spec: CalibrationSignalSpec,
        playback: Arc<dyn PlaybackScheduler + Send + Sync>,
        calibration: Arc<dyn CalibrationSink + Send + Sync>,
        clock: Arc<dyn ReceiverClock>,
    ) -> Self {
        Self {
            spec: Arc::new(spec),
            playback,
            calibration,
            clock,
        }
    }
}

pub trait CalibrationSink {
    fn apply(&self, submission: &CalibrationSubmission) -> Result<CalibrationApplyResponse>;
}

pub struct AppliedCalibrationSink<W: ConfigWriter + Send + Sync + 'static, C: PipelineController + Send + Sync + 'static> {
    applier: CalibrationApplier<W, C>,
}

impl<W: ConfigWriter + Send + Sync + 'static, C: PipelineController + Send + Sync + 'static>
    AppliedCalibrationSink<W, C>
{
    pub fn new(applier: CalibrationApplier<W, C>) -> Self {
        Self { applier }
    }
}

impl<W: ConfigWriter + Send + Sync + 'static, C: PipelineController + Send + Sync + 'static>
    CalibrationSink for AppliedCalibrationSink<W, C>
{
    fn apply(&self, submission: &CalibrationSubmission) -> Result<CalibrationApplyResponse> {
        let outcome = self.applier.apply_submission(submission)?;
        Ok(CalibrationApplyResponse {
            measured_latency_ms: outcome.measured_latency_ms,
            applied_offset_ms: outcome.applied_offset_ms,
            was_clamped: outcome.was_clamped,
        })
    }
}

pub fn router(state: ReceiverState) -> Router {
    Router::new()
        .route("/calibration/spec", get(calibration_spec))
        .route("/calibration/request", post(calibration_request))
        .route("/calibration/ready", post(calibration_ready))
        .route("/calibration/result", post(calibration_result))
        .route("/time", get(server_time))
        .with_state(state)
}

fn bad_request(rejection: JsonRejection) -> StatusCode {
    tracing::debug!(error = %rejection, "rejected malformed payload");
    StatusCode::BAD_REQUEST
}

async fn calibration_spec(State(state): State<ReceiverState>) -> Json<SpecResponse> {
    Json(SpecResponse {
        spec: state.spec.as_ref().clone(),
    })
}

async fn server_time(State(state): State<ReceiverState>) -> Json<ServerTime> {
    Json(ServerTime {
        server_time_ms: state.clock.now_ms(),
    })
}

async fn calibration_request(
    State(state): State<ReceiverState>,
    payload: Result<Json<CalibrationRequest>, JsonRejection>,
) -> StatusCode {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_request(rejection),
    };
    match state.playback.arm(&req) {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "failed to arm playback");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn calibration_ready(
    State(state): State<ReceiverState>,
    payload: Result<Json<CalibrationReady>, JsonRejection>,
) -> StatusCode {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_request(rejection),
    };
    match state.playback.commit(req.target_start_ms) {
        Ok(_) => StatusCode::OK,
        Err(PlaybackError::NotArmed) => {
            tracing::warn!(target_start_ms = req.target_start_ms, "ready received without request");
            StatusCode::CONFLICT
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to commit playback");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn calibration_result(
    State(state): State<ReceiverState>,
    payload: Result<Json<CalibrationSubmission>, JsonRejection>,
) -> Result<Json<CalibrationApplyResponse>, StatusCode> {
    let Json(submission) = payload.map_err(bad_request)?;
    tracing::info!(
        latency_ms = submission.latency_ms,
        confidence = submission.confidence,
        detections = submission.detections.len(),
        "calibration result received"
    );
    let applied = state.calibration.apply(&submission).map_err(|e| {
        tracing::error!(error = %e, "failed to apply calibration");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(applied))
}

pub async fn serve(router: Router, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await.context("bind")?;
    axum::serve(listener, router).await.context("serve")?;
    Ok(())
}
