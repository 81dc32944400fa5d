//! FLAC transcoder backed by `flacenc`
//!
//! Every call produces one self-contained FLAC stream (marker, STREAMINFO and
//! a single frame). Any packet boundary is therefore a valid resync point for
//! the receiver, at the cost of ~40 bytes of header per packet.

use flacenc::component::BitRepr;
use flacenc::error::{Verified, Verify};

use super::{select_sample_format, CodecCapabilities, Encoder, EncoderError, EncoderSetup};
use crate::types::{AudioFormat, Bitstream, ChannelLayout, SampleFormat};

/// Frames per packet (same block length as an AC-3 sync frame)
pub const FLAC_FRAMES_PER_CALL: usize = 1536;

/// Fallback output rate estimate before any packet has been produced,
/// as a fraction of the PCM byte rate
const ASSUMED_COMPRESSION: f64 = 0.6;

/// Lossless 5.1 encoder
pub struct FlacEncoder {
    config: Option<Verified<flacenc::config::Encoder>>,
    setup: Option<EncoderSetup>,
    bits: usize,
    samples: Vec<i32>,
    bytes_out: u64,
    seconds_in: f64,
}

impl Default for FlacEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlacEncoder {
    pub fn new() -> Self {
        Self {
            config: None,
            setup: None,
            bits: 0,
            samples: Vec::new(),
            bytes_out: 0,
            seconds_in: 0.0,
        }
    }

    /// Observed (or assumed) encoded bytes per second of input audio
    fn output_byte_rate(&self) -> f64 {
        if self.seconds_in > 0.0 && self.bytes_out > 0 {
            return self.bytes_out as f64 / self.seconds_in;
        }
        match &self.setup {
            Some(setup) => setup.input.bytes_per_second() * ASSUMED_COMPRESSION,
            None => 0.0,
        }
    }

    fn unpack(&mut self, data: &[u8], format: SampleFormat) {
        self.samples.clear();
        match format {
            SampleFormat::S16LE => {
                self.samples.extend(
                    data.chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]) as i32),
                );
            }
            _ => {
                // S24LE4: low three bytes, sign-extended
                self.samples.extend(
                    data.chunks_exact(4)
                        .map(|b| i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8),
                );
            }
        }
    }
}

impl Encoder for FlacEncoder {
    fn codec_name(&self) -> &str {
        "flac"
    }

    fn capabilities(&self) -> CodecCapabilities {
        CodecCapabilities {
            sample_formats: vec![SampleFormat::S24LE4, SampleFormat::S16LE],
            sample_rates: vec![44100, 48000, 88200, 96000],
            layout: ChannelLayout::layout_51(),
            frames_per_call: FLAC_FRAMES_PER_CALL,
        }
    }

    fn initialize(&mut self, format: &AudioFormat) -> Result<EncoderSetup, EncoderError> {
        let caps = self.capabilities();

        let (sample_format, needs_conversion) =
            select_sample_format(format.data_format, &caps.sample_formats)
                .ok_or(EncoderError::NoCompatibleFormat(format.data_format))?;

        let sample_rate = if caps.sample_rates.contains(&format.sample_rate) {
            format.sample_rate
        } else {
            return Err(EncoderError::CodecUnavailable(format!(
                "FLAC transcode at {}Hz",
                format.sample_rate
            )));
        };

        let config = flacenc::config::Encoder::default()
            .into_verified()
            .map_err(|e| EncoderError::CodecUnavailable(format!("{:?}", e)))?;

        let input = AudioFormat::new(sample_format, sample_rate, caps.layout.clone())
            .with_frames(caps.frames_per_call);
        let output = AudioFormat::new(
            SampleFormat::Raw(Bitstream::Flac),
            sample_rate,
            ChannelLayout::stereo(),
        )
        .with_encoded_rate(sample_rate);

        log::info!(
            "FLAC encoder: requested {} -> encoding {} ({} bits, conversion {})",
            format.data_format,
            input,
            sample_format.bits(),
            if needs_conversion { "needed" } else { "not needed" }
        );

        self.bits = sample_format.bits() as usize;
        self.config = Some(config);
        self.bytes_out = 0;
        self.seconds_in = 0.0;

        let setup = EncoderSetup {
            input,
            output,
            needs_conversion,
        };
        self.setup = Some(setup.clone());
        Ok(setup)
    }

    fn encode(&mut self, data: &[u8], frames: usize, out: &mut Vec<u8>) -> Result<usize, EncoderError> {
        let (input, channels, rate) = match &self.setup {
            Some(setup) => (
                setup.input.data_format,
                setup.input.channel_count(),
                setup.input.sample_rate,
            ),
            None => return Err(EncoderError::NotInitialized),
        };

        let expected = frames * channels * input.bytes_per_sample();
        if data.len() != expected || frames == 0 {
            return Err(EncoderError::InputSize {
                expected,
                got: data.len(),
            });
        }

        self.unpack(data, input);

        let config = self.config.as_ref().ok_or(EncoderError::NotInitialized)?;
        let source =
            flacenc::source::MemSource::from_samples(&self.samples, channels, self.bits, rate as usize);
        let stream = flacenc::encode_with_fixed_block_size(config, source, frames)
            .map_err(|e| EncoderError::EncodeFailed(format!("{:?}", e)))?;

        let mut sink = flacenc::bitsink::ByteSink::new();
        stream
            .write(&mut sink)
            .map_err(|e| EncoderError::EncodeFailed(format!("{:?}", e)))?;

        let packet = sink.as_slice();
        out.extend_from_slice(packet);

        self.bytes_out += packet.len() as u64;
        self.seconds_in += frames as f64 / rate as f64;
        Ok(packet.len())
    }

    fn delay(&self, pending_bytes: usize) -> f64 {
        let rate = self.output_byte_rate();
        if rate <= 0.0 {
            return 0.0;
        }
        pending_bytes as f64 / rate
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.bytes_out = 0;
        self.seconds_in = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert;
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    fn mix_format() -> AudioFormat {
        AudioFormat::new(SampleFormat::Float, 48000, ChannelLayout::layout_51())
    }

    /// Decode one FLAC packet to interleaved f32
    fn decode(packet: Vec<u8>) -> Vec<f32> {
        let mss = MediaSourceStream::new(Box::new(std::io::Cursor::new(packet)), Default::default());
        let mut hint = Hint::new();
        hint.with_extension("flac");
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .unwrap();
        let mut reader = probed.format;
        let track = reader.default_track().unwrap().clone();
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .unwrap();

        let mut samples = Vec::new();
        while let Ok(packet) = reader.next_packet() {
            let decoded = decoder.decode(&packet).unwrap();
            let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
        samples
    }

    fn encode_block(encoder: &mut FlacEncoder, setup: &EncoderSetup, pcm: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        convert::from_float(pcm, setup.input.data_format, &mut bytes).unwrap();
        let mut packet = Vec::new();
        let n = encoder
            .encode(&bytes, setup.frames_per_call(), &mut packet)
            .unwrap();
        assert_eq!(n, packet.len());
        packet
    }

    #[test]
    fn test_initialize_downgrades_float() {
        let mut encoder = FlacEncoder::new();
        let setup = encoder.initialize(&mix_format()).unwrap();
        assert_eq!(setup.input.data_format, SampleFormat::S24LE4);
        assert!(setup.needs_conversion);
        assert_eq!(setup.input.layout, ChannelLayout::layout_51());
        assert_eq!(setup.frames_per_call(), FLAC_FRAMES_PER_CALL);
        assert!(setup.output.is_raw());
    }

    #[test]
    fn test_unsupported_rate_is_rejected() {
        let mut encoder = FlacEncoder::new();
        let format = AudioFormat::new(SampleFormat::Float, 22050, ChannelLayout::layout_51());
        assert!(matches!(
            encoder.initialize(&format),
            Err(EncoderError::CodecUnavailable(_))
        ));
    }

    #[test]
    fn test_encode_before_initialize() {
        let mut encoder = FlacEncoder::new();
        let mut out = Vec::new();
        assert!(matches!(
            encoder.encode(&[0; 24], 1, &mut out),
            Err(EncoderError::NotInitialized)
        ));
    }

    #[test]
    fn test_silence_roundtrip_has_zero_rms() {
        let mut encoder = FlacEncoder::new();
        let setup = encoder.initialize(&mix_format()).unwrap();
        let silence = vec![0.0f32; FLAC_FRAMES_PER_CALL * 6];

        let packet = encode_block(&mut encoder, &setup, &silence);
        assert_eq!(&packet[..4], b"fLaC");

        let decoded = decode(packet);
        assert_eq!(decoded.len(), FLAC_FRAMES_PER_CALL * 6);
        let rms = (decoded.iter().map(|s| s * s).sum::<f32>() / decoded.len() as f32).sqrt();
        assert!(rms < 1e-6, "rms {}", rms);
    }

    #[test]
    fn test_tone_survives_roundtrip() {
        let mut encoder = FlacEncoder::new();
        let setup = encoder.initialize(&mix_format()).unwrap();

        let mut pcm = Vec::with_capacity(FLAC_FRAMES_PER_CALL * 6);
        for i in 0..FLAC_FRAMES_PER_CALL {
            let s = 0.5 * (i as f32 * 2.0 * std::f32::consts::PI * 1000.0 / 48000.0).sin();
            for ch in 0..6 {
                pcm.push(if ch == 2 { s } else { 0.0 });
            }
        }

        let decoded = decode(encode_block(&mut encoder, &setup, &pcm));
        assert_eq!(decoded.len(), pcm.len());
        for (a, b) in pcm.iter().zip(&decoded) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_delay_tracks_pending_bytes() {
        let mut encoder = FlacEncoder::new();
        let setup = encoder.initialize(&mix_format()).unwrap();
        assert_eq!(encoder.delay(0), 0.0);
        let before = encoder.delay(1000);
        assert!(before > 0.0);

        encode_block(&mut encoder, &setup, &vec![0.0; FLAC_FRAMES_PER_CALL * 6]);
        // Silence compresses far better than the initial estimate
        assert!(encoder.delay(1000) > before);
    }
}
