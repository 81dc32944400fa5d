//! Producer streams
//!
//! A [`Stream`] takes bytes in the producer's own format and turns them into
//! period-sized frames in the engine's format:
//!
//! ```text
//!  add_data ─► input block ─► to_float ─► resample ─► remap ─► segment ─► frame queue
//!  (producer)  (AudioBuffer)            (optional)                        │
//!                                                              get_frame ◄┘ (output thread)
//! ```
//!
//! Raw bitstream streams skip every stage: each full input block (one sink
//! period of bytes) becomes one opaque frame.
//!
//! # Threading
//!
//! All buffers sit behind a single per-stream mutex held briefly by both the
//! producer (`add_data`) and the output thread (`get_frame`). Transport flags
//! and gain scalars are atomics.
//!
//! # Buffering
//!
//! Everything buffered (input block + frame queue) is limited to
//! [`MAX_CACHE_LEVEL`] seconds; `space()` reports what is left and
//! `add_data` never takes more. After an underrun the stream waits until
//! [`MAX_WATER_LEVEL`] seconds are queued before it plays again.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::buffer::AudioBuffer;
use crate::convert;
use crate::limiter::{Limiter, MAX_AMPLIFICATION};
use crate::remap::{RemapOptions, Remapper};
use crate::resample::{ResampleError, ResampleQuality, StreamResampler};
use crate::types::{AtomicF32, AudioFormat, SampleFormat};

/// Most audio a stream buffers, in seconds
pub const MAX_CACHE_LEVEL: f64 = 0.5;

/// Audio that must be queued before playback resumes after an underrun
pub const MAX_WATER_LEVEL: f64 = 0.25;

/// Stream errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Invalid stream format: {0}")]
    InvalidFormat(String),

    #[error("Cannot initialize {input} stream against {target}")]
    Incompatible { input: String, target: String },

    #[error("Resampler setup failed: {0}")]
    Resample(#[from] ResampleError),
}

/// Stable identifier of a stream within one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream #{}.{}", self.index, self.generation)
    }
}

/// Creation options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Start paused; the producer calls `resume` once primed
    pub start_paused: bool,
    /// Build a resampler even at matching rates, so playback speed can be
    /// nudged later without a glitch
    pub force_resample: bool,
}

/// One period of output
#[derive(Debug, Clone, PartialEq)]
pub enum OutputFrame {
    /// Interleaved float samples in the engine layout
    Pcm(Vec<f32>),
    /// Opaque bitstream bytes, one sink period long
    Raw(Vec<u8>),
}

impl OutputFrame {
    pub fn is_raw(&self) -> bool {
        matches!(self, OutputFrame::Raw(_))
    }
}

/// Volume envelope advanced once per output sample frame
#[derive(Debug, Clone, Copy)]
struct Fade {
    current: f32,
    target: f32,
    step: f32,
}

impl Fade {
    /// Advance one frame; returns true once the target is reached
    fn step(&mut self) -> bool {
        self.current += self.step;
        let done = self.step == 0.0
            || (self.step > 0.0 && self.current >= self.target)
            || (self.step < 0.0 && self.current <= self.target);
        if done {
            self.current = self.target;
        }
        done
    }
}

struct StreamState {
    /// Format frames are produced in (None until initialized)
    output: Option<AudioFormat>,
    remap: RemapOptions,
    quality: ResampleQuality,
    /// Holds exactly one processing block of input bytes
    input: AudioBuffer,
    converted: Vec<f32>,
    resampled: Vec<f32>,
    remapped: Vec<f32>,
    /// Output samples short of a full frame
    pending: Vec<f32>,
    queue: VecDeque<OutputFrame>,
    remapper: Option<Remapper>,
    resampler: Option<StreamResampler>,
    /// User playback ratio, kept across re-initialization
    resample_ratio: f64,
    fade: Option<Fade>,
    limiter: Limiter,
    /// Frames required in the queue before playing again (0 = none)
    water_target: usize,
    /// A frame has been delivered since the last flush
    started: bool,
}

impl StreamState {
    /// Queue depth in output frames (queued periods plus partial)
    fn queued_output_frames(&self) -> usize {
        let Some(output) = &self.output else {
            return 0;
        };
        let partial = self.pending.len() / output.channel_count().max(1);
        self.queue.len() * output.frames + partial
    }
}

/// A producer-fed audio stream
pub struct Stream {
    id: StreamId,
    input_format: AudioFormat,
    options: StreamOptions,
    state: Mutex<StreamState>,
    paused: AtomicBool,
    draining: AtomicBool,
    drained: AtomicBool,
    destroyed: AtomicBool,
    volume: AtomicF32,
    replay_gain: AtomicF32,
    amplification: AtomicF32,
    underruns: AtomicUsize,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("format", &self.input_format)
            .field("paused", &self.is_paused())
            .field("draining", &self.is_draining())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Stream {
    /// Create an uninitialized stream for `format`
    pub fn new(id: StreamId, format: AudioFormat, options: StreamOptions) -> Result<Self, StreamError> {
        if !format.is_valid() || format.frame_size() == 0 {
            return Err(StreamError::InvalidFormat(format.to_string()));
        }

        Ok(Self {
            id,
            input_format: format,
            options,
            state: Mutex::new(StreamState {
                output: None,
                remap: RemapOptions::default(),
                quality: ResampleQuality::default(),
                input: AudioBuffer::new(),
                converted: Vec::new(),
                resampled: Vec::new(),
                remapped: Vec::new(),
                pending: Vec::new(),
                queue: VecDeque::new(),
                remapper: None,
                resampler: None,
                resample_ratio: 1.0,
                fade: None,
                limiter: Limiter::default(),
                water_target: 0,
                started: false,
            }),
            paused: AtomicBool::new(options.start_paused),
            draining: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            volume: AtomicF32::new(1.0),
            replay_gain: AtomicF32::new(1.0),
            amplification: AtomicF32::new(1.0),
            underruns: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// (Re)build the pipeline for `target`
    ///
    /// PCM streams need a PCM target and raw streams a raw one. Frames already
    /// queued in the old format are discarded; buffered input is kept.
    pub fn initialize(
        &self,
        target: &AudioFormat,
        remap: RemapOptions,
        quality: ResampleQuality,
    ) -> Result<(), StreamError> {
        if self.input_format.is_raw() != target.is_raw() || target.frames == 0 || !target.is_valid() {
            return Err(StreamError::Incompatible {
                input: self.input_format.to_string(),
                target: target.to_string(),
            });
        }

        let mut state = self.lock();

        let discarded = state.queue.len();
        state.queue.clear();
        state.pending.clear();

        let block_bytes = if target.is_raw() {
            state.remapper = None;
            state.resampler = None;
            target.period_bytes()
        } else {
            let in_rate = self.input_format.sample_rate as u64;
            let out_rate = target.sample_rate as u64;
            let block_frames = ((target.frames as u64 * in_rate).div_ceil(out_rate)).max(1) as usize;

            state.remapper = Some(Remapper::new(&self.input_format.layout, &target.layout, remap));
            state.resampler = if in_rate != out_rate
                || self.options.force_resample
                || state.resample_ratio != 1.0
            {
                let mut resampler = StreamResampler::new(
                    self.input_format.sample_rate,
                    target.sample_rate,
                    self.input_format.channel_count(),
                    block_frames,
                    quality,
                )?;
                if state.resample_ratio != 1.0 {
                    resampler.set_ratio(state.resample_ratio)?;
                }
                Some(resampler)
            } else {
                None
            };
            block_frames * self.input_format.frame_size()
        };

        // Carry buffered input over, up to the new block size
        let carried: Vec<u8> = state.input.as_slice().to_vec();
        state.input.alloc(block_bytes);
        let keep = carried.len().min(block_bytes);
        let keep = keep - keep % self.input_format.frame_size();
        state.input.push(&carried[..keep]);

        state.limiter.set_sample_rate(target.sample_rate);
        state.limiter.reset();
        state.output = Some(target.clone());
        state.remap = remap;
        state.quality = quality;
        state.water_target = 0;

        log::debug!(
            "{}: initialized {} -> {} (block {} bytes, resample {}, discarded {} frames)",
            self.id,
            self.input_format,
            target,
            block_bytes,
            state.resampler.is_some(),
            discarded
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().output.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Producer side
    // ─────────────────────────────────────────────────────────────────────

    /// Free bytes under the cache limit, in whole input frames
    pub fn space(&self) -> usize {
        let state = self.lock();
        self.space_locked(&state)
    }

    fn space_locked(&self, state: &StreamState) -> usize {
        if state.output.is_none() || self.draining.load(Ordering::Relaxed) {
            return 0;
        }
        let free = (MAX_CACHE_LEVEL - self.buffered_seconds(state)).max(0.0);
        let bytes = (free * self.input_format.bytes_per_second()) as usize;
        bytes - bytes % self.input_format.frame_size()
    }

    /// Accept as much of `data` as fits, in whole frames; returns bytes taken
    ///
    /// Never blocks. A short count is backpressure: retry the rest later.
    pub fn add_data(&self, data: &[u8]) -> usize {
        if self.draining.load(Ordering::Relaxed) || self.destroyed.load(Ordering::Relaxed) {
            return 0;
        }

        let mut state = self.lock();
        let accepted = data.len().min(self.space_locked(&state));
        let accepted = accepted - accepted % self.input_format.frame_size();

        let mut offset = 0;
        while offset < accepted {
            let n = (accepted - offset).min(state.input.free());
            state.input.push(&data[offset..offset + n]);
            offset += n;
            if state.input.is_full() {
                self.process_block(&mut state, false);
            }
        }
        accepted
    }

    /// Run the buffered input block through the pipeline
    ///
    /// With `finish`, also push out resampler tail and pad the last partial
    /// frame with silence.
    fn process_block(&self, state: &mut StreamState, finish: bool) {
        let Some(output) = state.output.clone() else {
            return;
        };

        if output.is_raw() {
            if state.input.is_empty() {
                return;
            }
            let mut frame = state.input.as_slice().to_vec();
            if finish {
                frame.resize(output.period_bytes(), 0);
            }
            if frame.len() == output.period_bytes() {
                state.queue.push_back(OutputFrame::Raw(frame));
                state.input.clear();
            }
            return;
        }

        let StreamState {
            input,
            converted,
            resampled,
            remapped,
            pending,
            queue,
            remapper,
            resampler,
            ..
        } = state;

        converted.clear();
        if let Err(e) = convert::to_float(input.as_slice(), self.input_format.data_format, converted) {
            log::error!("{}: dropping block: {}", self.id, e);
        }
        input.clear();

        let source: &[f32] = match resampler.as_mut() {
            Some(resampler) => {
                resampled.clear();
                let mut result = resampler.process(converted, resampled);
                if finish && result.is_ok() {
                    result = resampler.flush(resampled);
                }
                if let Err(e) = result {
                    log::error!("{}: resampling failed, dropping block: {}", self.id, e);
                    resampled.clear();
                }
                &resampled[..]
            }
            None => &converted[..],
        };

        remapped.clear();
        match remapper.as_ref() {
            Some(remapper) => remapper.process(source, remapped),
            None => remapped.extend_from_slice(source),
        }
        pending.extend_from_slice(remapped);

        let period = output.frames * output.channel_count();
        if finish && pending.len() % period != 0 {
            let padded = pending.len().div_ceil(period) * period;
            pending.resize(padded, 0.0);
        }
        while pending.len() >= period {
            let frame: Vec<f32> = pending.drain(..period).collect();
            queue.push_back(OutputFrame::Pcm(frame));
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Output side
    // ─────────────────────────────────────────────────────────────────────

    /// Next ready frame (output thread)
    ///
    /// `None` while paused, while refilling to the water level after an
    /// underrun, when starved (flags an underrun once playback had started)
    /// or when drained.
    pub fn get_frame(&self) -> Option<OutputFrame> {
        let mut state = self.lock();
        self.next_frame_locked(&mut state)
    }

    fn next_frame_locked(&self, state: &mut StreamState) -> Option<OutputFrame> {
        if self.paused.load(Ordering::Relaxed) || state.output.is_none() {
            return None;
        }
        let draining = self.draining.load(Ordering::Relaxed);

        if state.water_target > 0 && !draining {
            if state.queue.len() < state.water_target {
                return None;
            }
            log::debug!("{}: refilled to water level, resuming", self.id);
            state.water_target = 0;
        }

        match state.queue.pop_front() {
            Some(frame) => {
                state.started = true;
                Some(frame)
            }
            None if draining => {
                if !self.drained.swap(true, Ordering::Relaxed) {
                    log::debug!("{}: drained", self.id);
                }
                None
            }
            None => {
                if state.started {
                    let count = self.underruns.fetch_add(1, Ordering::Relaxed) + 1;
                    let period = state.output.as_ref().map_or(0.0, |f| f.period_seconds());
                    state.water_target = if period > 0.0 {
                        ((MAX_WATER_LEVEL / period).ceil() as usize).max(1)
                    } else {
                        1
                    };
                    state.started = false;
                    log::warn!(
                        "{}: underrun #{}, waiting for {} frames",
                        self.id,
                        count,
                        state.water_target
                    );
                }
                None
            }
        }
    }

    /// Pull one frame and accumulate it into `mix` with volume, replay gain,
    /// amplification and fade applied (output thread)
    ///
    /// Amplification above unity goes through the stream's limiter so the
    /// stream alone never exceeds full scale. The fade advances by one
    /// period even when no frame was available. Returns true if a frame was
    /// mixed.
    pub fn mix_into(&self, mix: &mut [f32], channels: usize) -> bool {
        let channels = channels.max(1);
        let mut state = self.lock();
        let frame = self.next_frame_locked(&mut state);
        let replay_gain = self.replay_gain.load();
        let frames = mix.len() / channels;

        let samples = match frame {
            Some(OutputFrame::Pcm(samples)) => samples,
            _ => {
                if let Some(fade) = state.fade.as_mut() {
                    let mut done = false;
                    for _ in 0..frames {
                        if fade.step() {
                            done = true;
                            break;
                        }
                    }
                    if done {
                        self.finish_fade(&mut state);
                    }
                }
                return false;
            }
        };

        let volume = self.volume.load();
        let amplification = self.amplification.load();
        let StreamState { fade, limiter, .. } = &mut *state;

        let mut fade_done = false;
        for (dst, src) in mix.chunks_exact_mut(channels).zip(samples.chunks_exact(channels)) {
            let mut gain = fade.as_ref().map_or(volume, |f| f.current) * replay_gain;
            if amplification > 1.0 {
                gain *= limiter.run(src, amplification);
            }
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s * gain;
            }
            if let Some(f) = fade.as_mut() {
                if !fade_done && f.step() {
                    fade_done = true;
                }
            }
        }
        if fade_done {
            self.finish_fade(&mut state);
        }
        true
    }

    fn finish_fade(&self, state: &mut StreamState) {
        if let Some(fade) = state.fade.take() {
            self.volume.store(fade.target);
            log::debug!("{}: fade finished at {:.3}", self.id, fade.target);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Stop accepting data and play out everything buffered
    ///
    /// The partial input block and the last partial frame are flushed through
    /// the pipeline padded with silence.
    pub fn drain(&self) {
        let mut state = self.lock();
        if self.draining.swap(true, Ordering::Relaxed) {
            return;
        }
        self.process_block(&mut state, true);
        if state.queue.is_empty() {
            self.drained.store(true, Ordering::Relaxed);
        }
        log::debug!("{}: draining {} frames", self.id, state.queue.len());
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed) && !self.drained.load(Ordering::Relaxed)
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Relaxed)
    }

    /// Discard everything buffered and reset transport state
    ///
    /// Idempotent. Volume, replay gain and playback ratio are kept.
    pub fn flush(&self) {
        let mut state = self.lock();
        state.input.clear();
        state.pending.clear();
        state.queue.clear();
        if let Some(resampler) = state.resampler.as_mut() {
            resampler.reset();
        }
        state.water_target = 0;
        state.started = false;
        state.fade = None;
        self.draining.store(false, Ordering::Relaxed);
        self.drained.store(false, Ordering::Relaxed);
    }

    /// Mark for reaping
    ///
    /// Buffered audio still plays out first, unless the stream is paused:
    /// nothing pulls a paused stream, so its audio is discarded instead.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        if !self.is_paused() {
            self.drain();
            return;
        }

        let mut state = self.lock();
        let discarded = state.queue.len();
        state.queue.clear();
        state.pending.clear();
        state.input.clear();
        self.draining.store(true, Ordering::Relaxed);
        self.drained.store(true, Ordering::Relaxed);
        log::debug!("{}: destroyed while paused, discarded {} frames", self.id, discarded);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Destroyed and nothing left to play: safe to reap
    pub fn is_finished(&self) -> bool {
        self.is_destroyed()
            && (self.is_paused() || self.is_drained() || self.lock().queue.is_empty())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Gain
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 1.0));
    }

    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    pub fn set_replay_gain(&self, gain: f32) {
        self.replay_gain.store(gain.max(0.0));
    }

    pub fn replay_gain(&self) -> f32 {
        self.replay_gain.load()
    }

    /// Boost above unity (1.0 = none), limited so the stream cannot clip
    pub fn set_amplification(&self, amplification: f32) {
        let amplification = amplification.clamp(1.0, MAX_AMPLIFICATION);
        if amplification != self.amplification.load() {
            self.lock().limiter.reset();
            self.amplification.store(amplification);
        }
    }

    pub fn amplification(&self) -> f32 {
        self.amplification.load()
    }

    /// Ramp the volume from `from` to `to` over `duration_ms`
    ///
    /// The step is per output frame at the engine rate. A zero duration jumps
    /// straight to `to`.
    pub fn fade_volume(&self, from: f32, to: f32, duration_ms: u32) {
        let from = from.clamp(0.0, 1.0);
        let to = to.clamp(0.0, 1.0);
        let mut state = self.lock();

        let rate = state
            .output
            .as_ref()
            .map_or(self.input_format.sample_rate, |f| f.sample_rate);
        let frames = (rate as u64 * duration_ms as u64 / 1000) as f32;
        if frames < 1.0 || from == to {
            state.fade = None;
            self.volume.store(to);
            return;
        }

        state.fade = Some(Fade {
            current: from,
            target: to,
            step: (to - from) / frames,
        });
        self.volume.store(from);
    }

    pub fn is_fading(&self) -> bool {
        self.lock().fade.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Rate
    // ─────────────────────────────────────────────────────────────────────

    /// Change the playback ratio (1.0 = nominal) without re-initializing
    ///
    /// Builds a resampler on first use if the stream had none. Returns false
    /// if the ratio is out of range or the stream carries a raw bitstream.
    pub fn set_resample_ratio(&self, ratio: f64) -> bool {
        if self.input_format.is_raw() {
            return false;
        }
        let mut state = self.lock();

        if state.resampler.is_none() {
            if let Some(output) = state.output.clone() {
                let chunk = state.input.capacity() / self.input_format.frame_size();
                match StreamResampler::new(
                    self.input_format.sample_rate,
                    output.sample_rate,
                    self.input_format.channel_count(),
                    chunk,
                    state.quality,
                ) {
                    Ok(resampler) => {
                        log::debug!("{}: resampler created for ratio {}", self.id, ratio);
                        state.resampler = Some(resampler);
                    }
                    Err(e) => {
                        log::error!("{}: {}", self.id, e);
                        return false;
                    }
                }
            }
        }

        if let Some(resampler) = state.resampler.as_mut() {
            if let Err(e) = resampler.set_ratio(ratio) {
                log::warn!("{}: {}", self.id, e);
                return false;
            }
        }
        state.resample_ratio = ratio;
        true
    }

    pub fn resample_ratio(&self) -> f64 {
        self.lock().resample_ratio
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timing
    // ─────────────────────────────────────────────────────────────────────

    fn buffered_seconds(&self, state: &StreamState) -> f64 {
        let input_bytes = state.input.used()
            + state
                .resampler
                .as_ref()
                .map_or(0, |r| r.pending_frames() * self.input_format.frame_size());
        let input = input_bytes as f64 / self.input_format.bytes_per_second();

        let output = match &state.output {
            Some(output) if output.sample_rate > 0 => {
                state.queued_output_frames() as f64 / output.sample_rate as f64
            }
            _ => 0.0,
        };
        input + output
    }

    /// Seconds of audio buffered in this stream
    pub fn cache_time(&self) -> f64 {
        let state = self.lock();
        self.buffered_seconds(&state)
    }

    /// Maximum seconds this stream buffers
    pub fn cache_total(&self) -> f64 {
        MAX_CACHE_LEVEL
    }

    /// Seconds until newly added data reaches the engine mix (buffering plus
    /// resampler filter delay); the sink's delay is added by the engine
    pub fn delay(&self) -> f64 {
        let state = self.lock();
        let filter = state.resampler.as_ref().map_or(0.0, |r| r.delay_seconds());
        self.buffered_seconds(&state) + filter
    }

    /// Frames waiting in the output queue
    pub fn queued_frames(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn underruns(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Format
    // ─────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.input_format
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    pub fn data_format(&self) -> SampleFormat {
        self.input_format.data_format
    }

    pub fn channel_count(&self) -> usize {
        self.input_format.channel_count()
    }

    pub fn sample_rate(&self) -> u32 {
        self.input_format.sample_rate
    }

    pub fn encoded_sample_rate(&self) -> Option<u32> {
        self.input_format.encoded_rate
    }

    pub fn frame_size(&self) -> usize {
        self.input_format.frame_size()
    }

    /// Format frames are produced in, once initialized
    pub fn output_format(&self) -> Option<AudioFormat> {
        self.lock().output.clone()
    }
}
