use std::fs;
use std::path::PathBuf;

use airsync_receiver_core::calibration::signal::{generate_legacy_signal, generate_structured_signal};
use airsync_shared_protocol::synth::DEFAULT_SAMPLE_RATE;
use airsync_shared_protocol::{encode_spec, ChirpConfig};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: generate-calibration-wav <output.wav> [spec.json]");
        eprintln!("       generate-calibration-wav --legacy <output.wav> [sample_rate] [gain]");
        std::process::exit(1);
    }

    if args[1] == "--legacy" {
        let Some(path) = args.get(2).map(PathBuf::from) else {
            eprintln!("--legacy needs an output path");
            std::process::exit(1);
        };
        let sample_rate: u32 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_SAMPLE_RATE);
        let gain: Option<f32> = args.get(4).and_then(|s| s.parse().ok());
        let config = ChirpConfig {
            amplitude: gain,
            ..ChirpConfig::default()
        };
        generate_legacy_signal(&config, sample_rate, &path)?;
        println!("Wrote legacy chirp WAV to {}", path.display());
        return Ok(());
    }

    let wav_path = PathBuf::from(&args[1]);
    let spec_path = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| wav_path.with_extension("json"));

    let signal = generate_structured_signal(&wav_path)?;
    fs::write(&spec_path, encode_spec(&signal.spec)?)?;
    println!(
        "Wrote calibration WAV to {} ({} markers, {} ms) and spec to {}",
        wav_path.display(),
        signal.spec.markers.len(),
        signal.spec.duration_ms(),
        spec_path.display()
    );
    Ok(())
}
