//! Sink error types

use thiserror::Error;

/// Errors that can occur while opening or driving an output sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// No devices available from any driver
    #[error("No audio output devices found")]
    NoDevices,

    /// No driver registered under this name
    #[error("Unknown sink driver: {0}")]
    DriverNotFound(String),

    /// Driver exists but does not know the device
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to get device configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build audio stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/play stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// Requested sample format cannot be carried by the device
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// WAV file output failed
    #[error("WAV output error: {0}")]
    Wav(#[from] hound::Error),
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;
