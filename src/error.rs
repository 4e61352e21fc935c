//! Error types for the identification engine

use crate::matcher::Candidate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("audio too short: {duration_ms}ms (minimum: {minimum_ms}ms)")]
    AudioTooShort { duration_ms: u64, minimum_ms: u64 },

    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("non-finite sample at index {0}")]
    NonFiniteSample(usize),

    #[error("silent input")]
    SilentInput,

    #[error("resampler failure: {0}")]
    Resample(String),

    #[error("wav decode error: {0}")]
    WavDecode(#[from] hound::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("track not found: {0}")]
    TrackNotFound(i64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("identification timed out after {elapsed_ms}ms")]
    Timeout {
        elapsed_ms: u64,
        /// Candidates accumulated before the budget ran out. Tentative: the
        /// matcher may not have seen every query hash.
        tentative: Vec<Candidate>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`EngineError`], matching the propagation
/// policy: input and processing failures surface to the caller unchanged,
/// storage failures fail the whole operation, cancellation and timeout are
/// cooperative outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Processing,
    Storage,
    Cancelled,
    Timeout,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_)
            | EngineError::InvalidInput(_)
            | EngineError::AudioTooShort { .. }
            | EngineError::UnsupportedSampleRate(_)
            | EngineError::SilentInput
            | EngineError::WavDecode(_)
            | EngineError::Io(_) => ErrorKind::Input,
            EngineError::NonFiniteSample(_) | EngineError::Resample(_) => ErrorKind::Processing,
            EngineError::Storage(_) | EngineError::TrackNotFound(_) => ErrorKind::Storage,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}
