//! Common types for Confluence
//!
//! This module contains the format vocabulary shared by streams, sinks, the
//! encoder and the engine: sample encodings, channel roles and layouts, and
//! the [`AudioFormat`] value type that ties them together.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Sample rate used when nothing else dictates one (idle engine, defaults)
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Working sample type for conversion, mixing and finalization
pub type Sample = f32;

/// `f32` stored as bits in an `AtomicU32`
///
/// Gain-style scalars written by control threads and read by the output
/// thread once per cycle. Relaxed ordering: a value may land one cycle late.
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Compressed bitstream carried by a raw (passthrough or transcoded) format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitstream {
    Ac3,
    Eac3,
    Dts,
    /// DTS-HD Master Audio / High Resolution
    DtsHd,
    TrueHd,
    Flac,
}

impl Bitstream {
    /// High-bitrate codecs that only travel over an 8-channel (HDMI) link
    pub fn needs_hd_link(&self) -> bool {
        matches!(self, Bitstream::DtsHd | Bitstream::TrueHd)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Bitstream::Ac3 => "AC3",
            Bitstream::Eac3 => "EAC3",
            Bitstream::Dts => "DTS",
            Bitstream::DtsHd => "DTS-HD",
            Bitstream::TrueHd => "TrueHD",
            Bitstream::Flac => "FLAC",
        }
    }
}

/// Sample encoding of a PCM or raw byte stream
///
/// Raw formats are opaque 16-bit words: they can be routed but never
/// converted or mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16LE,
    S16BE,
    /// 24-bit little endian, packed into 3 bytes
    S24LE3,
    /// 24-bit little endian in the low bytes of a 32-bit container
    S24LE4,
    S32LE,
    Float,
    Double,
    Raw(Bitstream),
}

impl SampleFormat {
    /// Storage size of one sample in bytes
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16LE | SampleFormat::S16BE => 2,
            SampleFormat::S24LE3 => 3,
            SampleFormat::S24LE4 | SampleFormat::S32LE | SampleFormat::Float => 4,
            SampleFormat::Double => 8,
            SampleFormat::Raw(_) => 2,
        }
    }

    /// Effective resolution in bits (24 for `S24LE4` despite its container)
    pub fn bits(&self) -> u32 {
        match self {
            SampleFormat::S24LE3 | SampleFormat::S24LE4 => 24,
            SampleFormat::Float => 32,
            SampleFormat::Double => 64,
            other => other.bytes_per_sample() as u32 * 8,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, SampleFormat::Raw(_))
    }

    /// Codec carried by a raw format
    pub fn bitstream(&self) -> Option<Bitstream> {
        match self {
            SampleFormat::Raw(bitstream) => Some(*bitstream),
            _ => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SampleFormat::Float | SampleFormat::Double)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::U8 => "U8",
            SampleFormat::S16LE => "S16LE",
            SampleFormat::S16BE => "S16BE",
            SampleFormat::S24LE3 => "S24LE3",
            SampleFormat::S24LE4 => "S24LE4",
            SampleFormat::S32LE => "S32LE",
            SampleFormat::Float => "Float",
            SampleFormat::Double => "Double",
            SampleFormat::Raw(bitstream) => bitstream.name(),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Speaker role of a single channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Front left
    FL,
    /// Front right
    FR,
    /// Front center
    FC,
    /// Low frequency effects
    LFE,
    /// Back left
    BL,
    /// Back right
    BR,
    /// Front left of center
    FLOC,
    /// Front right of center
    FROC,
    /// Back center
    BC,
    /// Side left
    SL,
    /// Side right
    SR,
    TFL,
    TFR,
    TFC,
    TC,
    TBL,
    TBR,
    TBC,
}

impl Channel {
    /// Channel order of the `WAVE_FORMAT_EXTENSIBLE` speaker mask, bit 0 first
    pub const WAVE_MASK_ORDER: [Channel; 18] = [
        Channel::FL,
        Channel::FR,
        Channel::FC,
        Channel::LFE,
        Channel::BL,
        Channel::BR,
        Channel::FLOC,
        Channel::FROC,
        Channel::BC,
        Channel::SL,
        Channel::SR,
        Channel::TC,
        Channel::TFL,
        Channel::TFC,
        Channel::TFR,
        Channel::TBL,
        Channel::TBC,
        Channel::TBR,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::FL => "FL",
            Channel::FR => "FR",
            Channel::FC => "FC",
            Channel::LFE => "LFE",
            Channel::BL => "BL",
            Channel::BR => "BR",
            Channel::FLOC => "FLOC",
            Channel::FROC => "FROC",
            Channel::BC => "BC",
            Channel::SL => "SL",
            Channel::SR => "SR",
            Channel::TFL => "TFL",
            Channel::TFR => "TFR",
            Channel::TFC => "TFC",
            Channel::TC => "TC",
            Channel::TBL => "TBL",
            Channel::TBR => "TBR",
            Channel::TBC => "TBC",
        }
    }
}

/// Ordered set of channel roles
///
/// The order is the interleaving order of samples within a frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelLayout {
    channels: Vec<Channel>,
}

impl ChannelLayout {
    /// Create a layout from explicit roles (duplicates are dropped)
    pub fn new(channels: Vec<Channel>) -> Self {
        let mut unique = Vec::with_capacity(channels.len());
        for ch in channels {
            if !unique.contains(&ch) {
                unique.push(ch);
            }
        }
        Self { channels: unique }
    }

    pub fn mono() -> Self {
        Self::new(vec![Channel::FC])
    }

    pub fn stereo() -> Self {
        Self::new(vec![Channel::FL, Channel::FR])
    }

    pub fn layout_21() -> Self {
        Self::new(vec![Channel::FL, Channel::FR, Channel::LFE])
    }

    /// 5.1 in the order used by WAV and FLAC: FL FR FC LFE BL BR
    pub fn layout_51() -> Self {
        Self::new(vec![
            Channel::FL,
            Channel::FR,
            Channel::FC,
            Channel::LFE,
            Channel::BL,
            Channel::BR,
        ])
    }

    pub fn layout_71() -> Self {
        Self::new(vec![
            Channel::FL,
            Channel::FR,
            Channel::FC,
            Channel::LFE,
            Channel::BL,
            Channel::BR,
            Channel::SL,
            Channel::SR,
        ])
    }

    /// Conventional layout for a bare channel count
    ///
    /// Counts without a conventional layout take the first `count` roles of
    /// the WAVE speaker mask order.
    pub fn from_count(count: usize) -> Self {
        match count {
            1 => Self::mono(),
            2 => Self::stereo(),
            3 => Self::layout_21(),
            6 => Self::layout_51(),
            8 => Self::layout_71(),
            n => Self::new(Channel::WAVE_MASK_ORDER.iter().take(n).copied().collect()),
        }
    }

    /// Layout from a `WAVE_FORMAT_EXTENSIBLE` speaker mask
    ///
    /// Falls back to [`ChannelLayout::from_count`] when the mask is empty or
    /// does not describe exactly `count` channels.
    pub fn from_wave_mask(mask: u32, count: usize) -> Self {
        let channels: Vec<Channel> = Channel::WAVE_MASK_ORDER
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, ch)| *ch)
            .collect();

        if channels.len() == count {
            Self::new(channels)
        } else {
            Self::from_count(count)
        }
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }

    /// Interleave index of a role, if present
    pub fn position(&self, channel: Channel) -> Option<usize> {
        self.channels.iter().position(|&c| c == channel)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        self.channels.iter().copied()
    }

    /// Keep only the roles also present in `limit`, preserving this order
    ///
    /// Used to cap a stream layout to the configured speaker set. Returns the
    /// limit itself if nothing would survive.
    pub fn intersect(&self, limit: &ChannelLayout) -> ChannelLayout {
        let kept: Vec<Channel> = self.iter().filter(|c| limit.contains(*c)).collect();
        if kept.is_empty() {
            limit.clone()
        } else {
            ChannelLayout::new(kept)
        }
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.channels.iter().map(|c| c.name()).collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// Complete description of a byte stream of audio
///
/// `frames` is the number of frames per processing period; it is zero for
/// a format that has not yet been negotiated with a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub data_format: SampleFormat,
    pub sample_rate: u32,
    /// Rate of the content inside a raw bitstream (None for PCM)
    pub encoded_rate: Option<u32>,
    pub layout: ChannelLayout,
    pub frames: usize,
}

impl AudioFormat {
    pub fn new(data_format: SampleFormat, sample_rate: u32, layout: ChannelLayout) -> Self {
        Self {
            data_format,
            sample_rate,
            encoded_rate: None,
            layout,
            frames: 0,
        }
    }

    /// Builder: set frames per processing period
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Builder: set the encoded sample rate of a raw bitstream
    pub fn with_encoded_rate(mut self, rate: u32) -> Self {
        self.encoded_rate = Some(rate);
        self
    }

    pub fn channel_count(&self) -> usize {
        self.layout.count()
    }

    /// Bytes per frame: channel count x bytes per sample
    pub fn frame_size(&self) -> usize {
        self.layout.count() * self.data_format.bytes_per_sample()
    }

    /// Bytes of one processing period
    pub fn period_bytes(&self) -> usize {
        self.frames * self.frame_size()
    }

    pub fn period_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames as f64 / self.sample_rate as f64
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.frame_size() as f64 * self.sample_rate as f64
    }

    pub fn is_raw(&self) -> bool {
        self.data_format.is_raw()
    }

    /// A format can carry audio only with a rate and at least one channel
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && !self.layout.is_empty()
    }

    /// Frames per period for a period length in milliseconds (at least 64)
    pub fn frames_for_ms(sample_rate: u32, period_ms: u32) -> usize {
        ((sample_rate as u64 * period_ms as u64 / 1000) as usize).max(64)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {} {} frames",
            self.data_format, self.sample_rate, self.layout, self.frames
        )?;
        if let Some(rate) = self.encoded_rate {
            write!(f, " (encoded {}Hz)", rate)?;
        }
        Ok(())
    }
}
