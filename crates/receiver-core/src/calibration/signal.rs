use crate::chirp::generate_chirp_samples;
use airsync_shared_protocol::synth::{structured_signal_spec, synthesize, to_pcm16};
use airsync_shared_protocol::{CalibrationSignalSpec, ChirpConfig};
use anyhow::{Context, Result};
use hound::WavWriter;
use std::path::{Path, PathBuf};

/// The structured signal together with the WAV it was rendered to.
#[derive(Debug, Clone)]
pub struct StructuredSignal {
    pub spec: CalibrationSignalSpec,
    pub path: PathBuf,
}

/// Writes mono 16-bit PCM, creating parent directories as needed.
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for s in samples {
        writer.write_sample(*s)?;
    }
    writer.finalize()?;
    Ok(())
}

pub fn render_signal(spec: &CalibrationSignalSpec, path: impl AsRef<Path>) -> Result<StructuredSignal> {
    spec.validate()?;
    let path = path.as_ref().to_path_buf();
    let pcm = to_pcm16(&synthesize(spec));
    write_wav(&path, &pcm, spec.sample_rate)?;
    tracing::info!(
        path = %path.display(),
        markers = spec.markers.len(),
        length_samples = spec.length_samples,
        "rendered calibration signal"
    );
    Ok(StructuredSignal {
        spec: spec.clone(),
        path,
    })
}

/// Renders the default structured signal to `path`.
pub fn generate_structured_signal(path: impl AsRef<Path>) -> Result<StructuredSignal> {
    render_signal(&structured_signal_spec(), path)
}

/// Renders the legacy repeated sweep to `path`.
pub fn generate_legacy_signal(
    config: &ChirpConfig,
    sample_rate: u32,
    path: impl AsRef<Path>,
) -> Result<PathBuf> {
    let path = path.as_ref().to_path_buf();
    let pcm = generate_chirp_samples(config, sample_rate, 1.0);
    write_wav(&path, &pcm, sample_rate)?;
    tracing::debug!(path = %path.display(), samples = pcm.len(), "rendered legacy chirp signal");
    Ok(path)
}
