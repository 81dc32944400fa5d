//! Bitstream transcoding
//!
//! In transcode mode the engine mixes into a fixed multichannel layout and
//! hands each finished block to an [`Encoder`], which turns it into a
//! compressed packet for a sink that accepts raw bitstreams.
//!
//! The encoder advertises what it can consume ([`CodecCapabilities`]);
//! [`Encoder::initialize`] picks the closest sample format it supports and
//! reports whether the engine must convert its float mix before encoding.

#[cfg(feature = "transcode")]
mod flac;

#[cfg(feature = "transcode")]
pub use flac::{FlacEncoder, FLAC_FRAMES_PER_CALL};

use thiserror::Error;

use crate::types::{AudioFormat, ChannelLayout, SampleFormat};

/// Encoder errors
#[derive(Error, Debug, Clone)]
pub enum EncoderError {
    /// No codec compiled in, or the codec refused its configuration
    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    /// Nothing in the codec's sample format list is usable
    #[error("No compatible sample format for {0}")]
    NoCompatibleFormat(SampleFormat),

    #[error("Encoder used before initialize")]
    NotInitialized,

    /// Input block does not match the negotiated geometry
    #[error("Expected {expected} bytes of input, got {got}")]
    InputSize { expected: usize, got: usize },

    /// The codec failed on a block
    #[error("Encode failed: {0}")]
    EncodeFailed(String),
}

/// What a codec can consume
#[derive(Debug, Clone)]
pub struct CodecCapabilities {
    /// Accepted input encodings, best first
    pub sample_formats: Vec<SampleFormat>,
    /// Accepted input rates (empty = any)
    pub sample_rates: Vec<u32>,
    /// Fixed input layout
    pub layout: ChannelLayout,
    /// Frames consumed per `encode` call
    pub frames_per_call: usize,
}

/// Result of encoder initialization
#[derive(Debug, Clone)]
pub struct EncoderSetup {
    /// Format `encode` expects: chosen encoding, fixed layout, one call's frames
    pub input: AudioFormat,
    /// Raw bitstream format handed to the sink
    pub output: AudioFormat,
    /// The engine's float mix must be converted to `input.data_format`
    pub needs_conversion: bool,
}

impl EncoderSetup {
    pub fn frames_per_call(&self) -> usize {
        self.input.frames
    }

    /// Input bytes of one `encode` call
    pub fn input_block_bytes(&self) -> usize {
        self.input.period_bytes()
    }
}

/// A compressed-bitstream encoder
pub trait Encoder: Send {
    fn codec_name(&self) -> &str;

    fn capabilities(&self) -> CodecCapabilities;

    /// Configure for `format` (the engine's mix rate and requested encoding)
    fn initialize(&mut self, format: &AudioFormat) -> Result<EncoderSetup, EncoderError>;

    /// Encode exactly one block of `frames` frames in the negotiated input
    /// format, appending any finished packet to `out`
    ///
    /// Returns the number of bytes appended (zero if the codec is still
    /// buffering).
    fn encode(&mut self, data: &[u8], frames: usize, out: &mut Vec<u8>) -> Result<usize, EncoderError>;

    /// Seconds of latency for `pending_bytes` of encoded output not yet
    /// consumed by the sink, plus codec look-ahead
    fn delay(&self, pending_bytes: usize) -> f64;

    /// Drop any buffered state
    fn reset(&mut self);
}

/// Pick the supported format closest in resolution to `requested`
///
/// An exact match wins. Otherwise the nearest bit depth is chosen, preferring
/// a downgrade on ties. Returns the choice and whether it differs from the
/// request, or `None` if nothing usable is supported.
pub fn select_sample_format(
    requested: SampleFormat,
    supported: &[SampleFormat],
) -> Option<(SampleFormat, bool)> {
    if supported.contains(&requested) {
        return Some((requested, false));
    }

    let wanted = requested.bits() as i64;
    supported
        .iter()
        .filter(|f| !f.is_raw())
        .min_by_key(|f| {
            let bits = f.bits() as i64;
            // Downgrades sort before upgrades at equal distance
            ((bits - wanted).abs(), bits > wanted)
        })
        .map(|f| (*f, true))
}

/// The encoder compiled into this build, if any
pub fn default_encoder() -> Option<Box<dyn Encoder>> {
    #[cfg(feature = "transcode")]
    {
        Some(Box::new(FlacEncoder::new()))
    }
    #[cfg(not(feature = "transcode"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_needs_no_conversion() {
        let choice = select_sample_format(
            SampleFormat::S16LE,
            &[SampleFormat::S24LE4, SampleFormat::S16LE],
        );
        assert_eq!(choice, Some((SampleFormat::S16LE, false)));
    }

    #[test]
    fn test_float_downgrades_to_widest_integer() {
        let choice = select_sample_format(
            SampleFormat::Float,
            &[SampleFormat::S16LE, SampleFormat::S24LE4],
        );
        assert_eq!(choice, Some((SampleFormat::S24LE4, true)));
    }

    #[test]
    fn test_tie_prefers_downgrade() {
        // 24 bits requested: 16 and 32 are equally far
        let choice = select_sample_format(
            SampleFormat::S24LE3,
            &[SampleFormat::S32LE, SampleFormat::S16LE],
        );
        assert_eq!(choice, Some((SampleFormat::S16LE, true)));
    }

    #[test]
    fn test_nothing_supported() {
        assert_eq!(select_sample_format(SampleFormat::Float, &[]), None);
    }
}
