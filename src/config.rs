//! Engine configuration
//!
//! Configuration is an explicit, immutable value handed to the engine at
//! construction. There is no global state and no environment or file
//! layering; callers that want either build the value themselves.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine and every pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub audio: AudioConfig,
    pub peaks: PeakConfig,
    pub fingerprint: FingerprintConfig,
    pub matcher: MatcherConfig,
    pub index: IndexConfig,
    /// Wall-clock budget for a single identification, in milliseconds.
    pub identify_timeout_ms: u64,
}

/// Spectrogram stage parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Canonical processing rate. All input is resampled to this.
    pub sample_rate: u32,
    /// STFT window size in samples. Must be a power of two.
    pub fft_size: usize,
    /// STFT hop in samples.
    pub hop_size: usize,
    /// Noise floor in dB (relative to the spectrogram maximum). Magnitudes
    /// below it are clamped to it.
    pub db_floor: f32,
    /// Inputs shorter than this are rejected.
    pub min_duration_ms: u64,
}

/// Peak extraction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakConfig {
    /// Half-width of the local-maximum neighborhood along the frequency
    /// axis, in bins.
    pub freq_neighborhood: usize,
    /// Half-width of the local-maximum neighborhood along the time axis,
    /// in frames.
    pub time_neighborhood: usize,
    /// Margin above the per-frame mean, in standard deviations of the
    /// frame's dB magnitudes.
    pub threshold_sigma: f32,
    /// Global cap on peak density. The strongest peaks win.
    pub peaks_per_second_cap: u32,
}

/// Constellation hashing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Maximum number of targets paired with each anchor.
    pub fan_value: usize,
    /// Closest allowed target, in frames after the anchor. Must be at
    /// least 1.
    pub target_zone_min: u32,
    /// Furthest allowed target, in frames after the anchor.
    pub target_zone_max: u32,
    /// Bits of the packed hash spent on the anchor frequency bin.
    pub anchor_freq_bits: u32,
    /// Bits spent on the target frequency bin.
    pub target_freq_bits: u32,
    /// Bits spent on the frame delta between target and anchor.
    pub delta_bits: u32,
}

/// Matching and acceptance parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Minimum histogram score for a candidate to be accepted at all.
    pub score_min: u32,
    /// Required ratio between the best and second-best score.
    pub margin: f32,
    /// Offset histogram bin width, in frames.
    pub offset_quantization: u32,
}

/// Index store parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Fingerprint rows committed per transaction during ingest.
    pub batch_size: usize,
    /// SQLite database path. ":memory:" keeps the index in memory.
    pub storage_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            peaks: PeakConfig::default(),
            fingerprint: FingerprintConfig::default(),
            matcher: MatcherConfig::default(),
            index: IndexConfig::default(),
            identify_timeout_ms: 30_000,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            fft_size: 2048,
            hop_size: 512,
            db_floor: -80.0,
            min_duration_ms: 100,
        }
    }
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            freq_neighborhood: 10,
            time_neighborhood: 10,
            threshold_sigma: 0.5,
            peaks_per_second_cap: 30,
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            fan_value: 5,
            target_zone_min: 1,
            target_zone_max: 20,
            anchor_freq_bits: 12,
            target_freq_bits: 12,
            delta_bits: 8,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            score_min: 5,
            margin: 1.5,
            offset_quantization: 1,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            storage_path: ":memory:".to_string(),
        }
    }
}

impl Config {
    /// Check internal consistency. Called by the engine at construction.
    pub fn validate(&self) -> Result<(), EngineError> {
        let a = &self.audio;
        if a.sample_rate == 0 {
            return Err(EngineError::Config("sample_rate must be positive".into()));
        }
        if a.fft_size < 2 || !a.fft_size.is_power_of_two() {
            return Err(EngineError::Config(format!(
                "fft_size must be a power of two >= 2, got {}",
                a.fft_size
            )));
        }
        if a.hop_size == 0 || a.hop_size > a.fft_size {
            return Err(EngineError::Config(format!(
                "hop_size must be in 1..={}, got {}",
                a.fft_size, a.hop_size
            )));
        }
        if !(a.db_floor < 0.0) {
            return Err(EngineError::Config("db_floor must be negative".into()));
        }

        let p = &self.peaks;
        if p.threshold_sigma < 0.0 {
            return Err(EngineError::Config("threshold_sigma must be non-negative".into()));
        }
        if p.peaks_per_second_cap == 0 {
            return Err(EngineError::Config("peaks_per_second_cap must be positive".into()));
        }

        let f = &self.fingerprint;
        if f.fan_value == 0 {
            return Err(EngineError::Config("fan_value must be positive".into()));
        }
        if f.target_zone_min == 0 || f.target_zone_min > f.target_zone_max {
            return Err(EngineError::Config(format!(
                "target zone [{}, {}] is empty or starts at 0",
                f.target_zone_min, f.target_zone_max
            )));
        }
        for (name, bits) in [
            ("anchor_freq_bits", f.anchor_freq_bits),
            ("target_freq_bits", f.target_freq_bits),
            ("delta_bits", f.delta_bits),
        ] {
            if bits == 0 || bits >= 32 {
                return Err(EngineError::Config(format!("{name} must be in 1..=31, got {bits}")));
            }
        }
        if f.anchor_freq_bits + f.target_freq_bits + f.delta_bits > 32 {
            return Err(EngineError::Config(
                "hash bit widths exceed 32 bits in total".into(),
            ));
        }
        if f.target_zone_max >= 1 << f.delta_bits {
            return Err(EngineError::Config(format!(
                "target_zone_max {} does not fit in {} delta bits",
                f.target_zone_max, f.delta_bits
            )));
        }

        let m = &self.matcher;
        if m.score_min == 0 {
            return Err(EngineError::Config("score_min must be positive".into()));
        }
        if !(m.margin >= 1.0) {
            return Err(EngineError::Config("margin must be at least 1.0".into()));
        }
        if m.offset_quantization == 0 {
            return Err(EngineError::Config("offset_quantization must be positive".into()));
        }

        let i = &self.index;
        if i.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be positive".into()));
        }
        if i.storage_path.is_empty() {
            return Err(EngineError::Config("storage_path must not be empty".into()));
        }

        Ok(())
    }

    /// Seconds of audio covered by one spectrogram hop.
    pub fn frame_duration(&self) -> f32 {
        self.audio.hop_size as f32 / self.audio.sample_rate as f32
    }
}
