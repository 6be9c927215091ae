//! Error types for the transcription engine.

use thiserror::Error;

/// Everything that can abort a transcription run or prevent one from starting.
///
/// Empty results (no peaks, no surviving notes) and notes that cannot be
/// placed on the fretboard are not errors and never show up here.
#[derive(Debug, Error)]
pub enum TabError {
    /// A configuration field is outside its valid range.
    #[error("Invalid configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// The analysis frame size must be a power of two.
    #[error("Frame size {0} is not a power of two")]
    FrameSizeNotPowerOfTwo(usize),

    /// Sample rate of zero, or too low for the configured bin range.
    #[error("Invalid sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    /// Open-string pitches, capo or fret range do not describe a playable instrument.
    #[error("Invalid string tuning: {0}")]
    InvalidTuning(String),

    /// The spectral kernel rejected its parameters.
    #[error("Spectral kernel initialisation failed: {0}")]
    KernelInit(String),

    /// The spectral kernel failed while transforming a frame.
    #[error("Spectral transform failed at frame {frame}: {source}")]
    Kernel {
        frame: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The spectral kernel returned the wrong number of bins.
    #[error("Spectral kernel returned {actual} bins, expected {expected}")]
    KernelOutputLength { expected: usize, actual: usize },

    /// The run was superseded by a newer request before it completed.
    #[error("Transcription run was cancelled")]
    Cancelled,

    /// The background worker is gone.
    #[error("Transcription worker disconnected")]
    WorkerDisconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for transcription operations
pub type TabResult<T> = Result<T, TabError>;
