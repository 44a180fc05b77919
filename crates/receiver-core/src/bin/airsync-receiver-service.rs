use std::path::PathBuf;
use std::sync::Arc;

use airsync_receiver_core::calibration::signal::generate_structured_signal;
use airsync_receiver_core::calibration::{
    CalibrationApplier, CommandPipelineController, FileConfigWriter,
};
use airsync_receiver_core::http::{router, serve, AppliedCalibrationSink, ReceiverState};
use airsync_receiver_core::playback::{CommandPlayback, SystemReceiverClock};
use airsync_receiver_core::ReceiverConfig;
use anyhow::Context;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("airsync=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AIRSYNC_RECEIVER_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/airsync/receiver.json"));
    let config = ReceiverConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?
        .apply_env();

    let signal = generate_structured_signal(&config.signal_path)
        .context("rendering calibration signal")?;
    let spec = signal.spec.clone();
    let clock = Arc::new(SystemReceiverClock);

    let applier = CalibrationApplier::new(
        FileConfigWriter::new(&config.applied_calibration_path),
        CommandPipelineController::new(config.restart_command.clone()),
    )
    .with_limit_ms(config.apply_limit_ms)
    .with_forced_latency(config.force_latency_ms);
    let sink = Arc::new(AppliedCalibrationSink::new(applier));
    let playback = Arc::new(CommandPlayback::new(
        signal,
        config.legacy_signal_path.clone(),
        config.playback_command.clone(),
        clock.clone(),
    ));

    let state = ReceiverState::new(spec, playback, sink, clock);
    let app = router(state);

    tracing::info!(addr = %config.bind_addr, "AirSync calibration receiver listening");

    tokio::select! {
        res = serve(app, config.bind_addr) => res?,
        _ = signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    Ok(())
}
