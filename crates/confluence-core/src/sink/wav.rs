//! WAV file sink
//!
//! Renders the engine output into a WAV file with `hound`. The device name is
//! the file path (`wav:/tmp/render.wav`). Writes are not paced, so the output
//! thread runs as fast as producers supply data.
//!
//! PCM is written as 32-bit float unless 16-bit was requested. Raw bitstreams
//! are stored as their 16-bit words, which keeps the file a valid container
//! for a bitstream capture.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Mutex;

use hound::{SampleFormat as WavSampleFormat, WavSpec, WavWriter};

use super::{DeviceInfo, Sink, SinkDriver, SinkError, SinkResult};
use crate::convert;
use crate::types::{AudioFormat, SampleFormat};

const DEFAULT_PERIOD_MS: u32 = 20;

/// Driver for the WAV file sink
#[derive(Debug, Default)]
pub struct WavDriver;

impl WavDriver {
    pub fn new() -> Self {
        Self
    }
}

impl SinkDriver for WavDriver {
    fn name(&self) -> &str {
        "wav"
    }

    fn create(&self, device: &str, desired: &AudioFormat) -> SinkResult<Box<dyn Sink>> {
        if device.is_empty() {
            return Err(SinkError::DeviceNotFound("empty WAV path".to_string()));
        }
        Ok(Box::new(WavSink::create(device, desired)?))
    }

    /// Files cannot be listed, so this driver never shows up in a picker
    fn enumerate(&self, _force_rescan: bool) -> Vec<DeviceInfo> {
        Vec::new()
    }
}

/// Sink writing to a WAV file
pub struct WavSink {
    format: AudioFormat,
    path: String,
    writer: Mutex<Option<WavWriter<BufWriter<File>>>>,
}

impl WavSink {
    pub fn create(path: &str, desired: &AudioFormat) -> SinkResult<Self> {
        if !desired.is_valid() {
            return Err(SinkError::UnsupportedFormat(desired.to_string()));
        }

        let data_format = match desired.data_format {
            SampleFormat::Raw(_) => desired.data_format,
            SampleFormat::S16LE | SampleFormat::S16BE | SampleFormat::U8 => SampleFormat::S16LE,
            _ => SampleFormat::Float,
        };

        let mut format = desired.clone();
        format.data_format = data_format;
        if format.frames == 0 {
            format.frames = AudioFormat::frames_for_ms(format.sample_rate, DEFAULT_PERIOD_MS);
        }

        let spec = WavSpec {
            channels: format.channel_count() as u16,
            sample_rate: format.sample_rate,
            bits_per_sample: if data_format == SampleFormat::Float { 32 } else { 16 },
            sample_format: if data_format == SampleFormat::Float {
                WavSampleFormat::Float
            } else {
                WavSampleFormat::Int
            },
        };

        let writer = WavWriter::create(path, spec)?;
        log::info!("WAV sink: writing {} to {}", format, path);

        Ok(Self {
            format,
            path: path.to_string(),
            writer: Mutex::new(Some(writer)),
        })
    }

    fn write(&self, writer: &mut WavWriter<BufWriter<File>>, data: &[u8]) -> Result<(), hound::Error> {
        if self.format.data_format == SampleFormat::Float {
            let mut samples = Vec::with_capacity(data.len() / 4);
            // Float -> Float conversion cannot fail
            let _ = convert::to_float(data, SampleFormat::Float, &mut samples);
            for sample in samples {
                writer.write_sample(sample)?;
            }
        } else {
            for word in data.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([word[0], word[1]]))?;
            }
        }
        Ok(())
    }
}

impl Sink for WavSink {
    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn add_packets(&self, data: &[u8], frames: usize) -> usize {
        let len = (frames * self.format.frame_size()).min(data.len());
        let Ok(mut guard) = self.writer.lock() else {
            return 0;
        };
        let Some(writer) = guard.as_mut() else {
            return 0;
        };
        if let Err(e) = self.write(writer, &data[..len]) {
            log::error!("WAV sink: write to {} failed: {}", self.path, e);
            // Closed writer: later writes are dropped silently
            *guard = None;
            return 0;
        }
        len / self.format.frame_size()
    }

    fn drain(&self) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(writer) = guard.as_mut() {
                if let Err(e) = writer.flush() {
                    log::error!("WAV sink: flush of {} failed: {}", self.path, e);
                }
            }
        }
    }

    fn delay(&self) -> f64 {
        0.0
    }

    fn cache_total(&self) -> f64 {
        0.0
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        let writer = match self.writer.get_mut() {
            Ok(writer) => writer.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(writer) = writer {
            match writer.finalize() {
                Ok(()) => log::info!("WAV sink: finalized {}", self.path),
                Err(e) => log::error!("WAV sink: finalize of {} failed: {}", self.path, e),
            }
        }
    }
}
