use std::path::{Path, PathBuf};

use airsync_calibration_client::{CalibrationConfig, MarkerDetector};
use airsync_shared_protocol::decode_spec;
use anyhow::{bail, Context};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("airsync=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: analyze-recording <spec.json> <recording.wav> [start_offset_samples]");
        std::process::exit(1);
    }
    let spec_path = PathBuf::from(&args[1]);
    let wav_path = PathBuf::from(&args[2]);
    let start_offset: i64 = match args.get(3) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid start offset {raw:?}"))?,
        None => 0,
    };

    let config = match std::env::var("AIRSYNC_CALIBRATION_CONFIG") {
        Ok(path) => CalibrationConfig::load(Path::new(&path)),
        Err(_) => CalibrationConfig::default(),
    }
    .apply_env();

    let spec_json = std::fs::read_to_string(&spec_path)
        .with_context(|| format!("reading {}", spec_path.display()))?;
    let spec = decode_spec(&spec_json).context("decoding signal spec")?;

    let (samples, sample_rate) = read_mono(&wav_path)?;
    if sample_rate != spec.sample_rate {
        bail!(
            "recording is {} Hz but the signal is {} Hz",
            sample_rate,
            spec.sample_rate
        );
    }

    let detector = MarkerDetector::new(config.detector);
    let measurement = detector.detect(&samples, &spec, start_offset);
    println!("{}", serde_json::to_string_pretty(&measurement)?);
    eprintln!("quality: {:?}", measurement.quality());
    Ok(())
}

/// First channel of a WAV file as floats in [-1, 1].
fn read_mono(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = interleaved.into_iter().step_by(channels).collect();
    Ok((mono, spec.sample_rate))
}
