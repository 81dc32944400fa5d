//! RIFF/WAVE reading for sound effects
//!
//! Reads a whole WAV file into memory. Handles PCM (8/16/24/32-bit), IEEE
//! float (32/64-bit) and `WAVE_FORMAT_EXTENSIBLE` with its speaker mask.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::convert;
use crate::types::{AudioFormat, ChannelLayout, SampleFormat};

const FORMAT_PCM: u16 = 1;
const FORMAT_IEEE_FLOAT: u16 = 3;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// WAV reading errors
#[derive(Debug, Clone)]
pub enum WavError {
    /// File not found or couldn't be read
    IoError(String),
    /// Not a RIFF/WAVE file
    InvalidFormat(String),
    /// Encoding we cannot decode
    UnsupportedEncoding { format_tag: u16, bits: u16 },
    /// Missing required chunk
    MissingChunk(&'static str),
    /// Truncated or inconsistent contents
    Corrupted(String),
}

impl std::fmt::Display for WavError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WavError::IoError(msg) => write!(f, "IO error: {}", msg),
            WavError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            WavError::UnsupportedEncoding { format_tag, bits } => {
                write!(f, "Unsupported encoding: tag {:#06x}, {} bits", format_tag, bits)
            }
            WavError::MissingChunk(name) => write!(f, "Missing required chunk: {}", name),
            WavError::Corrupted(msg) => write!(f, "File corrupted: {}", msg),
        }
    }
}

impl std::error::Error for WavError {}

impl From<std::io::Error> for WavError {
    fn from(e: std::io::Error) -> Self {
        WavError::IoError(e.to_string())
    }
}

/// Contents of the fmt chunk
#[derive(Debug, Clone)]
struct FmtChunk {
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
    channel_mask: u32,
}

impl FmtChunk {
    fn sample_format(&self) -> Result<SampleFormat, WavError> {
        let unsupported = WavError::UnsupportedEncoding {
            format_tag: self.format_tag,
            bits: self.bits_per_sample,
        };
        let container = self.block_align as usize / self.channels.max(1) as usize;
        match (self.format_tag, self.bits_per_sample) {
            (FORMAT_PCM, 8) => Ok(SampleFormat::U8),
            (FORMAT_PCM, 16) => Ok(SampleFormat::S16LE),
            (FORMAT_PCM, 24) if container == 4 => Ok(SampleFormat::S24LE4),
            (FORMAT_PCM, 24) => Ok(SampleFormat::S24LE3),
            (FORMAT_PCM, 32) => Ok(SampleFormat::S32LE),
            (FORMAT_IEEE_FLOAT, 32) => Ok(SampleFormat::Float),
            (FORMAT_IEEE_FLOAT, 64) => Ok(SampleFormat::Double),
            _ => Err(unsupported),
        }
    }
}

/// A fully decoded clip in its file's own rate and layout
#[derive(Debug, Clone)]
pub struct DecodedClip {
    /// Source format (sample encoding as stored in the file)
    pub format: AudioFormat,
    /// Interleaved samples
    pub samples: Vec<f32>,
}

impl DecodedClip {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channel_count().max(1)
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.format.sample_rate as f64
    }
}

/// Read and decode a WAV file
pub fn read_wav(path: &Path) -> Result<DecodedClip, WavError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut riff_header = [0u8; 12];
    reader
        .read_exact(&mut riff_header)
        .map_err(|_| WavError::InvalidFormat("File too short for a RIFF header".into()))?;
    if &riff_header[0..4] != b"RIFF" {
        return Err(WavError::InvalidFormat("Not a RIFF file".into()));
    }
    if &riff_header[8..12] != b"WAVE" {
        return Err(WavError::InvalidFormat("Not a WAVE file".into()));
    }

    let mut fmt: Option<FmtChunk> = None;
    let mut data: Option<Vec<u8>> = None;

    loop {
        let mut chunk_header = [0u8; 8];
        if reader.read_exact(&mut chunk_header).is_err() {
            break;
        }
        let chunk_id = [chunk_header[0], chunk_header[1], chunk_header[2], chunk_header[3]];
        let chunk_size = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]);

        match &chunk_id {
            b"fmt " => {
                fmt = Some(read_fmt_chunk(&mut reader, chunk_size)?);
            }
            b"data" => {
                let mut bytes = Vec::with_capacity(chunk_size as usize);
                // Tolerate a data chunk that runs past the end of the file
                reader.by_ref().take(chunk_size as u64).read_to_end(&mut bytes)?;
                if bytes.len() < chunk_size as usize {
                    log::warn!(
                        "WAV {:?}: data chunk truncated ({} of {} bytes)",
                        path,
                        bytes.len(),
                        chunk_size
                    );
                }
                data = Some(bytes);
            }
            _ => {
                reader.seek(SeekFrom::Current(chunk_size as i64))?;
            }
        }

        // Pad to word boundary
        if chunk_size % 2 != 0 {
            reader.seek(SeekFrom::Current(1))?;
        }

        if fmt.is_some() && data.is_some() {
            break;
        }
    }

    let fmt = fmt.ok_or(WavError::MissingChunk("fmt"))?;
    let data = data.ok_or(WavError::MissingChunk("data"))?;

    if fmt.channels == 0 || fmt.sample_rate == 0 {
        return Err(WavError::Corrupted(format!(
            "{} channels at {}Hz",
            fmt.channels, fmt.sample_rate
        )));
    }

    let sample_format = fmt.sample_format()?;
    // Some writers flag a single channel as FL; treat any one-channel file as mono
    let layout = if fmt.channels == 1 {
        ChannelLayout::mono()
    } else if fmt.channel_mask != 0 {
        ChannelLayout::from_wave_mask(fmt.channel_mask, fmt.channels as usize)
    } else {
        ChannelLayout::from_count(fmt.channels as usize)
    };
    let format = AudioFormat::new(sample_format, fmt.sample_rate, layout);

    // Whole frames only
    let usable = data.len() - data.len() % format.frame_size();
    let mut samples = Vec::with_capacity(usable / sample_format.bytes_per_sample());
    convert::to_float(&data[..usable], sample_format, &mut samples)
        .map_err(|e| WavError::InvalidFormat(e.to_string()))?;

    log::debug!(
        "WAV {:?}: {} ({} frames)",
        path,
        format,
        samples.len() / format.channel_count()
    );

    Ok(DecodedClip { format, samples })
}

/// Read the fmt chunk, resolving `WAVE_FORMAT_EXTENSIBLE` to its sub-format
fn read_fmt_chunk<R: Read>(reader: &mut R, size: u32) -> Result<FmtChunk, WavError> {
    if size < 16 {
        return Err(WavError::Corrupted("fmt chunk too small".into()));
    }

    let mut fmt_data = vec![0u8; size as usize];
    reader.read_exact(&mut fmt_data)?;

    let mut format_tag = u16::from_le_bytes([fmt_data[0], fmt_data[1]]);
    let channels = u16::from_le_bytes([fmt_data[2], fmt_data[3]]);
    let sample_rate = u32::from_le_bytes([fmt_data[4], fmt_data[5], fmt_data[6], fmt_data[7]]);
    let block_align = u16::from_le_bytes([fmt_data[12], fmt_data[13]]);
    let bits_per_sample = u16::from_le_bytes([fmt_data[14], fmt_data[15]]);
    let mut channel_mask = 0;

    if format_tag == FORMAT_EXTENSIBLE {
        if fmt_data.len() < 40 {
            return Err(WavError::Corrupted("extensible fmt chunk too small".into()));
        }
        channel_mask = u32::from_le_bytes([fmt_data[20], fmt_data[21], fmt_data[22], fmt_data[23]]);
        // First two bytes of the sub-format GUID carry the actual tag
        format_tag = u16::from_le_bytes([fmt_data[24], fmt_data[25]]);
    }

    Ok(FmtChunk {
        format_tag,
        channels,
        sample_rate,
        block_align,
        bits_per_sample,
        channel_mask,
    })
}
