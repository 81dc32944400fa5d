//! Engine error types

use thiserror::Error;

use crate::sink::SinkError;
use crate::sound::SoundError;
use crate::stream::StreamError;

/// Errors from engine construction and control
#[derive(Error, Debug)]
pub enum EngineError {
    /// Engine has been shut down
    #[error("Audio engine is not running")]
    NotRunning,

    /// Output thread could not be spawned
    #[error("Failed to spawn output thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// No sink could be opened, not even by fallback
    #[error("No usable output sink: {0}")]
    Sink(#[from] SinkError),

    /// Stream creation or initialization failed
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Sound effect could not be loaded
    #[error("Sound error: {0}")]
    Sound(#[from] SoundError),

    /// Stream handle outlived its stream
    #[error("Stream no longer exists")]
    StaleStream,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
