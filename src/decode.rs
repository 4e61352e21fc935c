//! Decoder collaborator boundary
//!
//! The engine consumes PCM; everything upstream of PCM lives behind
//! [`AudioSource`]. Compressed formats are expected to be decoded by an
//! external collaborator and handed in as [`AudioSource::RawPcm`].

use crate::error::EngineError;
use hound::SampleFormat;
use std::path::PathBuf;

/// Interleaved PCM plus the parameters needed to interpret it.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Samples in [-1, 1], interleaved by channel.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// A source of decodable audio.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Already-decoded PCM, e.g. from an external decoder or a capture
    /// collaborator.
    RawPcm {
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    },
    /// A WAV file on disk. 16/24/32-bit integer and 32-bit float formats
    /// are supported.
    WavFile(PathBuf),
}

impl AudioSource {
    pub fn decode(&self) -> Result<DecodedAudio, EngineError> {
        match self {
            AudioSource::RawPcm {
                samples,
                sample_rate,
                channels,
            } => Ok(DecodedAudio {
                samples: samples.clone(),
                sample_rate: *sample_rate,
                channels: *channels,
            }),
            AudioSource::WavFile(path) => decode_wav(path),
        }
    }
}

fn decode_wav(path: &PathBuf) -> Result<DecodedAudio, EngineError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}
