//! State shared between engine handles and the output thread
//!
//! ```text
//!  Engine / StreamHandle / SoundEffect          output thread
//!          │                                          │
//!          ├── settings      RwLock<EngineSettings>   │
//!          ├── output        RwLock<OutputState> ◄────┤ read per cycle
//!          ├── streams       Mutex<StreamArena>  ◄────┤ snapshot + reap
//!          ├── sounds        SoundBank           ◄────┤ mix plays
//!          └── volume, mute, flags (atomics)     ◄────┘
//! ```
//!
//! Lock order is output → streams → per-stream. Re-opening the sink takes
//! the output lock for writing, which parks the output thread for the
//! duration.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use super::arena::StreamArena;
use crate::config::EngineSettings;
use crate::encoder::{Encoder, EncoderSetup};
use crate::error::{EngineError, EngineResult};
use crate::sink::{OpenedSink, SinkError, SinkRegistry};
use crate::sound::SoundBank;
use crate::stream::{Stream, StreamId};
use crate::types::{AtomicF32, AudioFormat, Bitstream, ChannelLayout, SampleFormat, DEFAULT_SAMPLE_RATE};

/// How the output thread feeds the sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Float mix of every stream and sound, converted to the sink format
    #[default]
    Normal,
    /// The master stream's bitstream goes to the sink frame for frame
    Raw,
    /// Multichannel mix encoded into a bitstream the sink can carry
    Transcode,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputMode::Normal => "normal",
            OutputMode::Raw => "raw passthrough",
            OutputMode::Transcode => "transcode",
        })
    }
}

/// What the sink was last opened for
#[derive(Debug, Clone, PartialEq)]
struct OutputRequest {
    mode: OutputMode,
    format: AudioFormat,
    device: String,
}

/// Sink and format currently in use
#[derive(Default)]
pub(crate) struct OutputState {
    pub(crate) sink: Option<OpenedSink>,
    pub(crate) mode: OutputMode,
    /// Float format streams are mixed in (None in raw mode)
    pub(crate) mix_format: Option<AudioFormat>,
    pub(crate) master: Option<StreamId>,
    pub(crate) encoder: Option<Mutex<Box<dyn Encoder>>>,
    pub(crate) encoder_setup: Option<EncoderSetup>,
    last_driver: Option<String>,
    request: Option<OutputRequest>,
}

impl OutputState {
    /// Format a stream should produce frames in under the current sink
    pub(crate) fn stream_target(&self, stream: &Stream, period_ms: u32) -> Option<AudioFormat> {
        let granted = self.sink.as_ref()?.sink.format();
        let granted_frames = if granted.frames > 0 {
            granted.frames
        } else {
            AudioFormat::frames_for_ms(granted.sample_rate, period_ms)
        };

        let target = match (stream.format().is_raw(), self.mode) {
            (true, OutputMode::Raw) => granted.clone().with_frames(granted_frames),
            // Not playable here; frames are pulled and discarded
            (true, _) => stream
                .format()
                .clone()
                .with_frames(AudioFormat::frames_for_ms(stream.sample_rate(), period_ms)),
            (false, _) => match &self.mix_format {
                Some(mix) => mix.clone(),
                None => AudioFormat::new(SampleFormat::Float, granted.sample_rate, ChannelLayout::stereo())
                    .with_frames(granted_frames),
            },
        };
        Some(target)
    }
}

struct OutputPlan {
    request: OutputRequest,
    master: Option<StreamId>,
}

pub(crate) struct EngineShared {
    pub(crate) settings: RwLock<EngineSettings>,
    pub(crate) registry: SinkRegistry,
    output: RwLock<OutputState>,
    streams: Mutex<StreamArena>,
    pub(crate) sounds: Arc<SoundBank>,
    pub(crate) volume: AtomicF32,
    pub(crate) muted: AtomicBool,
    pub(crate) running: AtomicBool,
    /// Set by the output thread or handles; serviced at the top of a cycle
    pub(crate) reconfigure_requested: AtomicBool,
    pub(crate) transcode_failed: AtomicBool,
    /// Sink closed on request; nothing re-opens it until resume
    pub(crate) suspended: AtomicBool,
    /// Bumped on every sink re-open so the output thread resizes buffers
    pub(crate) generation: AtomicU64,
    /// Sink-format bytes held by the output thread, for delay reporting
    pub(crate) queued_bytes: AtomicUsize,
    pub(crate) viz: Mutex<Option<rtrb::Producer<f32>>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl EngineShared {
    pub(crate) fn new(
        settings: EngineSettings,
        registry: SinkRegistry,
        encoder: Option<Box<dyn Encoder>>,
    ) -> Self {
        let (wake_tx, wake_rx) = crossbeam::channel::bounded(1);
        Self {
            settings: RwLock::new(settings),
            registry,
            output: RwLock::new(OutputState {
                encoder: encoder.map(Mutex::new),
                ..OutputState::default()
            }),
            streams: Mutex::new(StreamArena::new()),
            sounds: Arc::new(SoundBank::new()),
            volume: AtomicF32::new(1.0),
            muted: AtomicBool::new(false),
            running: AtomicBool::new(true),
            reconfigure_requested: AtomicBool::new(false),
            transcode_failed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            queued_bytes: AtomicUsize::new(0),
            viz: Mutex::new(None),
            wake_tx,
            wake_rx,
        }
    }

    pub(crate) fn settings(&self) -> EngineSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn read_output(&self) -> RwLockReadGuard<'_, OutputState> {
        self.output.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_output(&self) -> RwLockWriteGuard<'_, OutputState> {
        self.output.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn lock_streams(&self) -> MutexGuard<'_, StreamArena> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Master gain after mute
    pub(crate) fn master_gain(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume.load()
        }
    }

    /// Nudge the output thread out of its idle wait
    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let _ = self.wake_rx.recv_timeout(timeout);
    }

    /// Seconds between the mix and the speaker
    pub(crate) fn output_delay(&self) -> f64 {
        let output = self.read_output();
        let Some(opened) = output.sink.as_ref() else {
            return 0.0;
        };
        let queued = self.queued_bytes.load(Ordering::Relaxed);

        let held = match (output.mode, output.encoder.as_ref()) {
            (OutputMode::Transcode, Some(encoder)) => encoder
                .lock()
                .map(|e| e.delay(queued))
                .unwrap_or(0.0),
            _ => {
                let bytes_per_second = opened.sink.format().bytes_per_second();
                if bytes_per_second > 0.0 {
                    queued as f64 / bytes_per_second
                } else {
                    0.0
                }
            }
        };
        opened.sink.delay() + held
    }

    fn plan(&self, settings: &EngineSettings, master: Option<&Stream>, output: &OutputState) -> OutputPlan {
        let period_ms = settings.period_ms();
        let speakers = settings.speakers.layout();
        let encoder_usable =
            output.encoder.is_some() && !self.transcode_failed.load(Ordering::Relaxed);
        let pcm_master = master.filter(|m| !m.format().is_raw());

        let raw_allowed = master
            .and_then(|m| m.data_format().bitstream())
            .is_some_and(|bitstream| settings.passthrough_allowed(bitstream));

        let mode = match master {
            Some(m) if m.format().is_raw() && raw_allowed => OutputMode::Raw,
            Some(m) if !m.format().is_raw()
                && settings.transcode
                && m.channel_count() > 2
                && encoder_usable =>
            {
                OutputMode::Transcode
            }
            _ => OutputMode::Normal,
        };

        let format = match (mode, master) {
            (OutputMode::Raw, Some(m)) => {
                let frames = AudioFormat::frames_for_ms(m.sample_rate(), period_ms);
                m.format().clone().with_frames(frames)
            }
            _ => {
                let rate = settings
                    .sample_rate
                    .or(pcm_master.map(|m| m.sample_rate()))
                    .unwrap_or(DEFAULT_SAMPLE_RATE);
                let layout = match pcm_master {
                    Some(m) => m.format().layout.intersect(&speakers),
                    None => ChannelLayout::stereo().intersect(&speakers),
                };
                AudioFormat::new(SampleFormat::Float, rate, layout)
                    .with_frames(AudioFormat::frames_for_ms(rate, period_ms))
            }
        };

        let device = match mode {
            OutputMode::Normal => settings.audio_device.clone(),
            _ => settings.passthrough_device().to_string(),
        };

        OutputPlan {
            request: OutputRequest { mode, format, device },
            master: master.map(|m| m.id()),
        }
    }

    /// Bring the sink in line with the master stream and settings
    ///
    /// Without `force` this is a no-op (beyond initializing new streams) when
    /// the sink already matches. Otherwise the old sink is drained and
    /// dropped, a new one opened with fallback, and every stream and sound
    /// re-initialized for the granted format.
    pub(crate) fn reconfigure(&self, force: bool) -> EngineResult<()> {
        let settings = self.settings();
        let mut output = self.write_output();
        let master = self.lock_streams().master();
        let plan = self.plan(&settings, master.as_deref(), &output);

        if self.suspended.load(Ordering::Acquire) {
            log::debug!("Output suspended, not opening a sink");
            output.master = plan.master;
            return Ok(());
        }

        if !force && output.sink.is_some() && output.request.as_ref() == Some(&plan.request) {
            output.master = plan.master;
            self.initialize_streams(&output, &settings, false);
            return Ok(());
        }

        if let Some(old) = output.sink.take() {
            log::info!("Closing sink {}:{}", old.driver, old.device);
            old.sink.drain();
        }
        self.generation.fetch_add(1, Ordering::AcqRel);

        let mut mode = plan.request.mode;
        let mut desired = plan.request.format.clone();
        let mut setup = None;

        if mode == OutputMode::Transcode {
            let result = output
                .encoder
                .as_ref()
                .map(|encoder| {
                    encoder
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .initialize(&plan.request.format)
                });
            match result {
                Some(Ok(s)) => {
                    let frames = AudioFormat::frames_for_ms(s.output.sample_rate, settings.period_ms());
                    desired = s.output.clone().with_frames(frames);
                    setup = Some(s);
                }
                Some(Err(e)) => {
                    log::warn!("Transcode unavailable ({}), mixing PCM instead", e);
                    mode = OutputMode::Normal;
                }
                None => mode = OutputMode::Normal,
            }
        }

        let previous_driver = output.last_driver.clone();
        let opened = self
            .registry
            .get_sink(&plan.request.device, &desired, previous_driver.as_deref())
            .and_then(|opened| {
                let granted = opened.sink.format();
                if !granted.is_raw() && mode != OutputMode::Normal {
                    log::warn!(
                        "Sink {}:{} refused {} ({} granted), mixing PCM instead",
                        opened.driver,
                        opened.device,
                        desired,
                        granted
                    );
                    mode = OutputMode::Normal;
                    setup = None;
                }
                if granted.is_raw() && mode == OutputMode::Normal {
                    return Err(SinkError::UnsupportedFormat(granted.to_string()));
                }
                Ok(opened)
            });

        let opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                output.mode = mode;
                output.mix_format = None;
                output.encoder_setup = None;
                output.master = plan.master;
                output.request = None;
                self.sounds.reconfigure(
                    None,
                    settings.remap_options(),
                    settings.resample_quality,
                );
                return Err(EngineError::Sink(e));
            }
        };

        let granted = opened.sink.format().clone();
        let mix_format = match mode {
            OutputMode::Raw => None,
            OutputMode::Transcode => setup.as_ref().map(|s| {
                AudioFormat::new(SampleFormat::Float, s.input.sample_rate, s.input.layout.clone())
                    .with_frames(s.frames_per_call())
            }),
            OutputMode::Normal => {
                let frames = if granted.frames > 0 {
                    granted.frames
                } else {
                    desired.frames
                };
                Some(
                    AudioFormat::new(SampleFormat::Float, granted.sample_rate, granted.layout.clone())
                        .with_frames(frames),
                )
            }
        };

        if output.mode != mode {
            log::info!("Output mode: {} -> {}", output.mode, mode);
        }
        log::info!(
            "Output ready: {} mode on {}:{}, sink format {}, mix format {}",
            mode,
            opened.driver,
            opened.device,
            granted,
            mix_format
                .as_ref()
                .map_or_else(|| "none".to_string(), |f| f.to_string())
        );

        output.last_driver = Some(opened.driver.clone());
        output.sink = Some(opened);
        output.mode = mode;
        output.mix_format = mix_format;
        output.encoder_setup = setup;
        output.master = plan.master;
        output.request = Some(plan.request);

        self.initialize_streams(&output, &settings, true);
        self.sounds.reconfigure(
            output.mix_format.as_ref(),
            settings.remap_options(),
            settings.resample_quality,
        );
        Ok(())
    }

    /// Initialize streams for the current sink (`all`) or only new ones
    fn initialize_streams(&self, output: &OutputState, settings: &EngineSettings, all: bool) {
        let streams = self.lock_streams();
        for stream in streams.iter() {
            if !all && stream.is_initialized() {
                continue;
            }
            let Some(target) = output.stream_target(stream, settings.period_ms()) else {
                continue;
            };
            if let Err(e) = stream.initialize(&target, settings.remap_options(), settings.resample_quality) {
                log::error!("{}: initialization failed: {}", stream.id(), e);
            }
        }
    }

    /// Rebuild every remapper after a remap-only settings change
    pub(crate) fn reinitialize_streams(&self) {
        let settings = self.settings();
        let output = self.read_output();
        self.initialize_streams(&output, &settings, true);
        self.sounds.reconfigure(
            output.mix_format.as_ref(),
            settings.remap_options(),
            settings.resample_quality,
        );
    }

    /// Close the sink and keep it closed until `resume`
    ///
    /// Returns false if already suspended.
    pub(crate) fn suspend(&self) -> bool {
        if self.suspended.swap(true, Ordering::AcqRel) {
            return false;
        }
        log::info!("Suspending output");
        self.close_output();
        self.sounds.discard_plays();
        true
    }

    /// Re-open the sink after `suspend`
    pub(crate) fn resume(&self) -> EngineResult<()> {
        if !self.suspended.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("Resuming output");
        self.reconfigure(true)
    }

    /// Whether `bitstream` can reach the configured passthrough device
    pub(crate) fn supports_raw(&self, bitstream: Bitstream) -> bool {
        let settings = self.settings();
        if !settings.passthrough_allowed(bitstream) {
            return false;
        }
        let device = settings.passthrough_device();
        let (driver, name) = self.registry.parse_device(device, None);
        self.registry
            .enumerate(false)
            .into_iter()
            .find(|d| d.driver == driver && d.name == name)
            .is_some_and(|d| d.supports_raw && (!bitstream.needs_hd_link() || d.max_channels >= 8))
    }

    /// Close the sink at shutdown
    pub(crate) fn close_output(&self) {
        let mut output = self.write_output();
        if let Some(opened) = output.sink.take() {
            log::info!("Closing sink {}:{}", opened.driver, opened.device);
            opened.sink.drain();
        }
        output.request = None;
        output.mix_format = None;
    }
}
