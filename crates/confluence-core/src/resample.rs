//! Variable-ratio sample rate conversion
//!
//! Wraps `rubato`'s sinc resampler for interleaved stream data. The effective
//! ratio is the fixed ratio between stream and engine rates multiplied by a
//! user ratio (playback speed nudging for A/V sync), and the user ratio can be
//! changed at any time without rebuilding the filter.

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest allowed deviation of the user ratio from 1.0 (either direction)
pub const MAX_RATIO_DEVIATION: f64 = 2.0;

/// Resampler errors
#[derive(Error, Debug, Clone)]
pub enum ResampleError {
    #[error("Resampler initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Resampling failed: {0}")]
    ProcessFailed(String),

    #[error("Resample ratio {0} out of range")]
    RatioOutOfRange(f64),
}

/// Sinc filter quality preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl ResampleQuality {
    fn params(self) -> SincInterpolationParameters {
        match self {
            ResampleQuality::Low => SincInterpolationParameters {
                sinc_len: 64,
                f_cutoff: 0.9,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::Blackman,
            },
            ResampleQuality::Medium => SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris,
            },
            ResampleQuality::High => SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.99,
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 512,
                window: WindowFunction::BlackmanHarris2,
            },
        }
    }
}

/// Interleaved resampler with an input accumulator
///
/// `SincFixedIn` consumes fixed-size chunks; input is buffered here until a
/// full chunk is available.
pub struct StreamResampler {
    inner: SincFixedIn<f32>,
    base_ratio: f64,
    user_ratio: f64,
    output_rate: u32,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    planar: Vec<Vec<f32>>,
}

impl StreamResampler {
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        chunk_frames: usize,
        quality: ResampleQuality,
    ) -> Result<Self, ResampleError> {
        if input_rate == 0 || output_rate == 0 || channels == 0 {
            return Err(ResampleError::InitializationFailed(format!(
                "invalid geometry {}Hz -> {}Hz x{}",
                input_rate, output_rate, channels
            )));
        }

        let base_ratio = output_rate as f64 / input_rate as f64;
        let chunk_frames = chunk_frames.max(64);
        let inner = SincFixedIn::<f32>::new(
            base_ratio,
            MAX_RATIO_DEVIATION,
            quality.params(),
            chunk_frames,
            channels,
        )
        .map_err(|e| ResampleError::InitializationFailed(e.to_string()))?;

        log::debug!(
            "Resampler: {}Hz -> {}Hz, {} channels, chunk {} frames, {:?} quality",
            input_rate,
            output_rate,
            channels,
            chunk_frames,
            quality
        );

        Ok(Self {
            inner,
            base_ratio,
            user_ratio: 1.0,
            output_rate,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels * 2),
            planar: vec![Vec::with_capacity(chunk_frames); channels],
        })
    }

    /// User ratio currently applied on top of the fixed rate ratio
    pub fn ratio(&self) -> f64 {
        self.user_ratio
    }

    /// Set the user ratio; takes effect on the next chunk
    pub fn set_ratio(&mut self, ratio: f64) -> Result<(), ResampleError> {
        if !(1.0 / MAX_RATIO_DEVIATION..=MAX_RATIO_DEVIATION).contains(&ratio) {
            return Err(ResampleError::RatioOutOfRange(ratio));
        }
        self.inner
            .set_resample_ratio(self.base_ratio * ratio, true)
            .map_err(|e| ResampleError::ProcessFailed(e.to_string()))?;
        self.user_ratio = ratio;
        Ok(())
    }

    /// Input frames waiting for a full chunk
    pub fn pending_frames(&self) -> usize {
        self.pending.len() / self.channels
    }

    /// Filter delay in seconds at the output rate
    pub fn delay_seconds(&self) -> f64 {
        self.inner.output_delay() as f64 / self.output_rate as f64
    }

    /// Feed interleaved samples, appending any produced output to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), ResampleError> {
        self.pending.extend_from_slice(input);

        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            self.deinterleave(consumed, self.chunk_frames);
            let produced = self
                .inner
                .process(&self.planar, None)
                .map_err(|e| ResampleError::ProcessFailed(e.to_string()))?;
            interleave(&produced, out);
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Push out whatever input is still pending (used when draining)
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<(), ResampleError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let frames = self.pending_frames();
        self.deinterleave(0, frames);
        let produced = self
            .inner
            .process_partial(Some(&self.planar), None)
            .map_err(|e| ResampleError::ProcessFailed(e.to_string()))?;
        interleave(&produced, out);
        self.pending.clear();
        Ok(())
    }

    /// Drop pending input and filter state
    pub fn reset(&mut self) {
        self.inner.reset();
        self.pending.clear();
    }

    fn deinterleave(&mut self, offset: usize, frames: usize) {
        let channels = self.channels;
        for (ch, plane) in self.planar.iter_mut().enumerate() {
            plane.clear();
            plane.extend(
                self.pending[offset..offset + frames * channels]
                    .iter()
                    .skip(ch)
                    .step_by(channels),
            );
        }
    }
}

fn interleave(planar: &[Vec<f32>], out: &mut Vec<f32>) {
    let frames = planar.first().map_or(0, |p| p.len());
    out.reserve(frames * planar.len());
    for i in 0..frames {
        for plane in planar {
            out.push(plane[i]);
        }
    }
}
