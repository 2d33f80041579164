// Erreurs du mixer - configuration, capacité des queues, driver audio

use thiserror::Error;

use crate::messaging::action::ActionHandle;

/// Errors surfaced to the control thread.
///
/// Nothing in here is ever produced inside the audio callback: runtime
/// conditions there (underruns, overruns, result queue pressure) are only
/// counted, see [`crate::audio::diagnostics::EngineStats`].
#[derive(Debug, Error)]
pub enum MixerError {
    #[error("Ring buffer capacity must be a power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("Ring buffer element length must be at least 1")]
    InvalidElementLength,

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Action queue is full")]
    QueueFull,

    #[error("Invalid channel mapping: {0}")]
    InvalidChannelMapping(String),

    #[error("Incompatible element size: ring buffer has {actual} bytes per element, expected {expected}")]
    IncompatibleElementSize { expected: usize, actual: usize },

    #[error("Executor has been dropped, no more actions can be processed")]
    Disconnected,

    #[error("No retired record for {0}")]
    MissingRecord(ActionHandle),

    #[error("No audio device found")]
    NoDevice,

    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ron::error::SpannedError),

    #[error("Configuration serialization error: {0}")]
    ConfigSerialization(#[from] ron::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

pub type MixerResult<T> = Result<T, MixerError>;

impl From<cpal::DefaultStreamConfigError> for MixerError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        MixerError::Stream(format!("Configuration error: {}", e))
    }
}

impl From<cpal::BuildStreamError> for MixerError {
    fn from(e: cpal::BuildStreamError) -> Self {
        MixerError::Stream(format!("Error in stream creation: {}", e))
    }
}

impl From<cpal::PlayStreamError> for MixerError {
    fn from(e: cpal::PlayStreamError) -> Self {
        MixerError::Stream(format!("Error in stream beginning: {}", e))
    }
}
