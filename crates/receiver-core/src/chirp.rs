use airsync_shared_protocol::ChirpConfig;
use std::f32::consts::PI;

/// Edge fade applied to each legacy sweep to avoid clicks.
const FADE_MS: f32 = 5.0;

/// Renders the legacy repeated sweep: `repetitions` linear chirps, each
/// followed by `interval_ms` of silence. `cfg.amplitude` overrides `gain`.
pub fn generate_chirp_samples(cfg: &ChirpConfig, sample_rate: u32, gain: f32) -> Vec<i16> {
    let sr = sample_rate as f32;
    let duration_s = cfg.duration as f32 / 1000.0;
    let interval_s = cfg.interval_ms as f32 / 1000.0;
    let sweep_k = if duration_s > 0.0 {
        (cfg.end_freq as f32 - cfg.start_freq as f32) / duration_s
    } else {
        0.0
    };
    let amp = cfg.amplitude.unwrap_or(gain).clamp(0.0, 1.0);

    let len = (duration_s * sr) as usize;
    let fade = ((FADE_MS / 1000.0 * sr) as usize).min(len / 2).max(1);
    let single = (0..len)
        .map(|n| {
            let t = n as f32 / sr;
            let phase = 2.0 * PI * (cfg.start_freq as f32 * t + 0.5 * sweep_k * t * t);
            let edge = n.min(len - 1 - n);
            let env = if edge < fade {
                0.5 - 0.5 * (PI * edge as f32 / fade as f32).cos()
            } else {
                1.0
            };
            (phase.sin() * amp * env * i16::MAX as f32).round() as i16
        })
        .collect::<Vec<_>>();
    let silence = vec![0i16; (interval_s * sr) as usize];

    let mut out = Vec::with_capacity((single.len() + silence.len()) * cfg.repetitions.max(1) as usize);
    for _ in 0..cfg.repetitions.max(1) {
        out.extend_from_slice(&single);
        out.extend_from_slice(&silence);
    }
    out
}
