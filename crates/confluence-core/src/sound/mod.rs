//! Sound effects
//!
//! Short clips (UI clicks, notifications) decoded fully into memory and
//! prepared once for the engine's current mix format. A clip can be playing
//! any number of times at once: each play is a cursor over the same shared,
//! read-only sample buffer.
//!
//! ```text
//!  SoundEffect ──play()──► SoundBank.plays: [ {clip, cursor}, {clip, cursor} ]
//!       │                        │
//!       │ Shared<PreparedClip>   │ output thread mixes + advances cursors,
//!       └────────────────────────┘ finished plays drop their clip reference
//! ```
//!
//! The prepared buffer is a `basedrop::Shared`, so it stays alive while any
//! play still references it and is freed off the output thread.

mod wav;

pub use wav::{read_wav, DecodedClip, WavError};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use basedrop::Shared;
use thiserror::Error;

use crate::engine::gc::gc_handle;
use crate::remap::{RemapOptions, Remapper};
use crate::resample::{ResampleError, ResampleQuality, StreamResampler};
use crate::types::{AtomicF32, AudioFormat};

/// Sound effect errors
#[derive(Error, Debug)]
pub enum SoundError {
    #[error("Failed to read sound {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: WavError,
    },

    #[error("Engine has no PCM output format yet")]
    NoOutputFormat,

    #[error("Failed to prepare sound: {0}")]
    Prepare(#[from] ResampleError),
}

/// Clip converted to the mix format
#[derive(Debug)]
pub struct PreparedClip {
    samples: Vec<f32>,
    channels: usize,
}

impl PreparedClip {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Remap then resample `clip` into `target`'s layout and rate
pub fn prepare_clip(
    clip: &DecodedClip,
    target: &AudioFormat,
    remap: RemapOptions,
    quality: ResampleQuality,
) -> Result<PreparedClip, ResampleError> {
    let remapper = Remapper::new(&clip.format.layout, &target.layout, remap);
    let mut remapped = Vec::with_capacity(clip.frames() * target.channel_count());
    remapper.process(&clip.samples, &mut remapped);

    let samples = if clip.format.sample_rate == target.sample_rate {
        remapped
    } else {
        let mut resampler = StreamResampler::new(
            clip.format.sample_rate,
            target.sample_rate,
            target.channel_count(),
            1024,
            quality,
        )?;
        let mut out = Vec::new();
        resampler.process(&remapped, &mut out)?;
        resampler.flush(&mut out)?;
        out
    };

    Ok(PreparedClip {
        samples,
        channels: target.channel_count(),
    })
}

/// Per-effect state shared between the handle and the bank
struct SoundShared {
    id: u64,
    path: PathBuf,
    source: DecodedClip,
    prepared: Mutex<Option<Shared<PreparedClip>>>,
    volume: Arc<AtomicF32>,
}

/// One in-flight play
struct SoundPlay {
    sound_id: u64,
    clip: Shared<PreparedClip>,
    /// Next frame to mix
    cursor: usize,
    volume: Arc<AtomicF32>,
}

struct BankState {
    format: Option<AudioFormat>,
    remap: RemapOptions,
    quality: ResampleQuality,
    sounds: Vec<Weak<SoundShared>>,
    plays: Vec<SoundPlay>,
}

/// Loaded sounds and in-flight plays of one engine
pub struct SoundBank {
    state: Mutex<BankState>,
    next_id: AtomicU64,
}

impl Default for SoundBank {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundBank {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BankState {
                format: None,
                remap: RemapOptions::default(),
                quality: ResampleQuality::default(),
                sounds: Vec::new(),
                plays: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BankState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load a WAV file and prepare it for the current format
    pub fn load(self: &Arc<Self>, path: &Path) -> Result<SoundEffect, SoundError> {
        let source = read_wav(path).map_err(|source| SoundError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        // Prepare outside the lock; the output thread mixes under it
        let (format, remap, quality) = {
            let state = self.lock();
            (state.format.clone(), state.remap, state.quality)
        };
        let format = format.ok_or(SoundError::NoOutputFormat)?;
        let prepared = prepare_clip(&source, &format, remap, quality)?;

        let mut state = self.lock();
        let shared = Arc::new(SoundShared {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            source,
            prepared: Mutex::new(Some(Shared::new(&gc_handle(), prepared))),
            volume: Arc::new(AtomicF32::new(1.0)),
        });
        state.sounds.retain(|s| s.strong_count() > 0);
        state.sounds.push(Arc::downgrade(&shared));

        log::info!(
            "Sound loaded: {:?} ({:.2}s, {})",
            path,
            shared.source.duration_seconds(),
            shared.source.format
        );

        Ok(SoundEffect {
            shared,
            bank: Arc::clone(self),
        })
    }

    /// Switch to a new mix format (`None` while no PCM is being mixed)
    ///
    /// Stops every play and re-prepares every loaded sound.
    pub fn reconfigure(
        &self,
        format: Option<&AudioFormat>,
        remap: RemapOptions,
        quality: ResampleQuality,
    ) {
        let mut state = self.lock();
        state.plays.clear();
        state.format = format.cloned();
        state.remap = remap;
        state.quality = quality;
        state.sounds.retain(|s| s.strong_count() > 0);

        for sound in state.sounds.iter().filter_map(Weak::upgrade) {
            let prepared = match format {
                Some(format) => match prepare_clip(&sound.source, format, remap, quality) {
                    Ok(clip) => Some(Shared::new(&gc_handle(), clip)),
                    Err(e) => {
                        log::error!("Sound {:?}: re-prepare failed: {}", sound.path, e);
                        None
                    }
                },
                None => None,
            };
            if let Ok(mut slot) = sound.prepared.lock() {
                *slot = prepared;
            }
        }
    }

    /// Mix every play into `mix` (interleaved, `channels` wide)
    ///
    /// Advances cursors and retires finished plays. Returns true if anything
    /// was mixed.
    pub fn mix_into(&self, mix: &mut [f32], channels: usize) -> bool {
        let mut state = self.lock();
        if state.plays.is_empty() {
            return false;
        }

        let frames = mix.len() / channels.max(1);
        let mut mixed = false;
        for play in state.plays.iter_mut() {
            if play.clip.channels != channels {
                // Stale play from before a format change
                play.cursor = play.clip.frames();
                continue;
            }
            let volume = play.volume.load();
            let n = frames.min(play.clip.frames() - play.cursor);
            let start = play.cursor * channels;
            let src = &play.clip.samples[start..start + n * channels];
            for (dst, s) in mix.iter_mut().zip(src) {
                *dst += s * volume;
            }
            play.cursor += n;
            mixed |= n > 0;
        }
        state.plays.retain(|p| p.cursor < p.clip.frames());
        mixed
    }

    pub fn has_plays(&self) -> bool {
        !self.lock().plays.is_empty()
    }

    /// Drop all plays without mixing them
    pub fn discard_plays(&self) {
        self.lock().plays.clear();
    }

    fn play(&self, sound: &SoundShared) -> bool {
        let mut state = self.lock();
        let clip = match sound.prepared.lock() {
            Ok(prepared) => prepared.clone(),
            Err(_) => None,
        };
        let Some(clip) = clip else {
            log::debug!("Sound {:?}: not prepared, play ignored", sound.path);
            return false;
        };
        if clip.frames() == 0 {
            return false;
        }
        state.plays.push(SoundPlay {
            sound_id: sound.id,
            clip,
            cursor: 0,
            volume: Arc::clone(&sound.volume),
        });
        true
    }

    fn stop(&self, sound_id: u64) {
        self.lock().plays.retain(|p| p.sound_id != sound_id);
    }

    fn is_playing(&self, sound_id: u64) -> bool {
        self.lock().plays.iter().any(|p| p.sound_id == sound_id)
    }
}

/// Handle to a loaded sound effect
///
/// Dropping the handle stops its plays.
pub struct SoundEffect {
    shared: Arc<SoundShared>,
    bank: Arc<SoundBank>,
}

impl SoundEffect {
    /// Start a new play; returns false if the sound cannot play right now
    pub fn play(&self) -> bool {
        self.bank.play(&self.shared)
    }

    /// Stop all plays of this sound
    pub fn stop(&self) {
        self.bank.stop(self.shared.id);
    }

    pub fn is_playing(&self) -> bool {
        self.bank.is_playing(self.shared.id)
    }

    /// Set the volume (0.0 - 1.0); applies to plays already in flight
    pub fn set_volume(&self, volume: f32) {
        self.shared.volume.store(volume.clamp(0.0, 1.0));
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume.load()
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn duration_seconds(&self) -> f64 {
        self.shared.source.duration_seconds()
    }
}

impl Drop for SoundEffect {
    fn drop(&mut self) {
        self.bank.stop(self.shared.id);
    }
}

impl std::fmt::Debug for SoundEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundEffect")
            .field("id", &self.shared.id)
            .field("path", &self.shared.path)
            .finish()
    }
}
