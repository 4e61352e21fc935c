//! Spectrogram computation
//!
//! Turns decoded PCM into a log-magnitude time-frequency matrix: downmix to
//! mono, resample to the canonical rate, then a Hann-windowed STFT with the
//! final frame zero-padded. Magnitudes are normalized to the global maximum
//! and expressed in dB, clipped to `[db_floor, 0]`. The whole stage is
//! deterministic: the same input produces byte-identical output on the same
//! build.

use crate::config::AudioConfig;
use crate::decode::DecodedAudio;
use crate::error::EngineError;
use ndarray::Array2;
use num_complex::Complex;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use rustfft::FftPlanner;

/// Input sample rates outside this range are rejected.
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// Relative magnitude floor applied before the log, so the dB conversion
/// never sees zero.
const MAG_EPSILON: f32 = 1e-10;

/// Log-magnitude spectrogram. Rows are frequency bins (0 .. fft_size/2),
/// columns are frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub data: Array2<f32>,
    /// Seconds of audio advanced per frame.
    pub frame_duration: f32,
}

impl Spectrogram {
    pub fn num_bins(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_frames(&self) -> usize {
        self.data.ncols()
    }

    pub fn duration_seconds(&self) -> f32 {
        self.num_frames() as f32 * self.frame_duration
    }
}

/// Compute the log-magnitude spectrogram of `audio`.
pub fn compute(audio: &DecodedAudio, cfg: &AudioConfig) -> Result<Spectrogram, EngineError> {
    if audio.sample_rate < MIN_SAMPLE_RATE || audio.sample_rate > MAX_SAMPLE_RATE {
        return Err(EngineError::UnsupportedSampleRate(audio.sample_rate));
    }
    if audio.channels == 0 {
        return Err(EngineError::InvalidInput("zero channels".into()));
    }
    if audio.samples.len() % audio.channels as usize != 0 {
        return Err(EngineError::InvalidInput(
            "interleaved sample count is not divisible by the channel count".into(),
        ));
    }
    if let Some(index) = audio.samples.iter().position(|s| !s.is_finite()) {
        return Err(EngineError::NonFiniteSample(index));
    }

    let mono = downmix_to_mono(&audio.samples, audio.channels);

    let duration_ms = mono.len() as u64 * 1000 / audio.sample_rate as u64;
    if duration_ms < cfg.min_duration_ms {
        return Err(EngineError::AudioTooShort {
            duration_ms,
            minimum_ms: cfg.min_duration_ms,
        });
    }
    let peak = mono.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak == 0.0 {
        return Err(EngineError::SilentInput);
    }

    let mono = if audio.sample_rate == cfg.sample_rate {
        mono
    } else {
        resample(&mono, audio.sample_rate, cfg.sample_rate)?
    };

    stft(&mono, cfg)
}

/// Average interleaved channels down to one.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Band-limited sinc resampling of a mono buffer.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, EngineError> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    const CHUNK: usize = 1024;
    let ratio = to_rate as f64 / from_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, CHUNK, 1)
        .map_err(|e| EngineError::Resample(e.to_string()))?;

    let mut output = Vec::with_capacity((samples.len() as f64 * ratio) as usize + CHUNK);
    let mut chunks = samples.chunks_exact(CHUNK);
    for chunk in &mut chunks {
        let mut frames = resampler
            .process(&[chunk], None)
            .map_err(|e| EngineError::Resample(e.to_string()))?;
        output.append(&mut frames[0]);
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut frames = resampler
            .process_partial(Some(&[rest]), None)
            .map_err(|e| EngineError::Resample(e.to_string()))?;
        output.append(&mut frames[0]);
    }
    Ok(output)
}

fn stft(mono: &[f32], cfg: &AudioConfig) -> Result<Spectrogram, EngineError> {
    let window = hann_window(cfg.fft_size);
    let num_bins = cfg.fft_size / 2 + 1;
    let num_frames = mono.len().div_ceil(cfg.hop_size);

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(cfg.fft_size);

    let mut data = Array2::zeros((num_bins, num_frames));
    let mut buffer = vec![Complex::new(0.0f32, 0.0); cfg.fft_size];
    for frame in 0..num_frames {
        let start = frame * cfg.hop_size;
        let available = mono.len().saturating_sub(start).min(cfg.fft_size);
        for (i, slot) in buffer.iter_mut().enumerate() {
            let sample = if i < available { mono[start + i] } else { 0.0 };
            *slot = Complex::new(sample * window[i], 0.0);
        }
        fft.process(&mut buffer);
        for (bin, value) in buffer.iter().take(num_bins).enumerate() {
            data[[bin, frame]] = value.norm();
        }
    }

    let max = data.iter().fold(0.0f32, |m, &v| m.max(v));
    if max <= 0.0 {
        return Err(EngineError::SilentInput);
    }
    let floor = cfg.db_floor;
    data.mapv_inplace(|m| (20.0 * ((m / max).max(MAG_EPSILON)).log10()).max(floor));

    Ok(Spectrogram {
        data,
        frame_duration: cfg.hop_size as f32 / cfg.sample_rate as f32,
    })
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}
