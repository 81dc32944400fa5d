//! The mixing engine
//!
//! `Engine` owns the output thread and the state it shares with producers.
//! There is no global instance: hosts start as many engines as they like
//! and each one shuts down when dropped.
//!
//! # Usage
//!
//! ```ignore
//! let engine = Engine::start(EngineSettings::default(), SinkRegistry::with_defaults())?;
//! let stream = engine.make_stream(
//!     SampleFormat::S16LE, 44100, None, ChannelLayout::stereo(), StreamOptions::default())?;
//! let taken = stream.add_data(&pcm);   // retry the rest later
//! ```

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::gc::{start_collector, CollectorConfig};
use super::handle::StreamHandle;
use super::output::OutputWorker;
use super::state::{EngineShared, OutputMode};
use crate::config::{EngineSettings, SettingKey};
use crate::encoder::{default_encoder, Encoder};
use crate::error::{EngineError, EngineResult};
use crate::sink::SinkRegistry;
use crate::sound::SoundEffect;
use crate::stream::{Stream, StreamOptions};
use crate::types::{AudioFormat, Bitstream, ChannelLayout, SampleFormat};

/// A running mixing engine
pub struct Engine {
    shared: Arc<EngineShared>,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Open the configured sink and start the output thread
    ///
    /// Uses the encoder compiled into this build for transcode mode.
    pub fn start(settings: EngineSettings, registry: SinkRegistry) -> EngineResult<Self> {
        Self::start_with_encoder(settings, registry, default_encoder())
    }

    /// Start with an explicit transcode encoder (or none)
    pub fn start_with_encoder(
        settings: EngineSettings,
        registry: SinkRegistry,
        encoder: Option<Box<dyn Encoder>>,
    ) -> EngineResult<Self> {
        let settings = settings.validated();
        start_collector(CollectorConfig::for_settings(&settings));
        log::info!(
            "Starting audio engine: device '{}', drivers {:?}, encoder {}",
            settings.audio_device,
            registry.driver_names(),
            encoder.as_ref().map_or("none", |e| e.codec_name())
        );

        let shared = Arc::new(EngineShared::new(settings, registry, encoder));
        shared.reconfigure(true)?;

        let worker = OutputWorker::new(Arc::clone(&shared));
        let thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Stop the output thread, drain and close the sink
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        log::info!("Shutting down audio engine");

        self.shared.running.store(false, Ordering::Release);
        self.shared.wake();
        if thread.join().is_err() {
            log::error!("Output thread panicked");
        }

        self.shared.close_output();
        self.shared.sounds.discard_plays();
        self.shared.registry.cleanup();
        log::info!("Audio engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Release the output device without stopping the engine
    ///
    /// The sink is drained and closed and stays closed until [`resume`]:
    /// new streams, settings changes and master changes do not re-open it.
    /// Streams keep what they have buffered. Returns false if the engine is
    /// stopped or already suspended.
    ///
    /// [`resume`]: Engine::resume
    pub fn suspend(&self) -> bool {
        self.is_running() && self.shared.suspend()
    }

    /// Re-open the sink after [`suspend`](Engine::suspend)
    pub fn resume(&self) -> EngineResult<()> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let resumed = self.shared.resume();
        self.shared.wake();
        resumed
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Producers
    // ─────────────────────────────────────────────────────────────────────

    /// Create a stream; it becomes the master stream
    ///
    /// The sink is re-opened if the new master needs a different output
    /// format or mode.
    pub fn make_stream(
        &self,
        data_format: SampleFormat,
        sample_rate: u32,
        encoded_sample_rate: Option<u32>,
        layout: ChannelLayout,
        options: StreamOptions,
    ) -> EngineResult<StreamHandle> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let mut format = AudioFormat::new(data_format, sample_rate, layout);
        if let Some(rate) = encoded_sample_rate {
            format = format.with_encoded_rate(rate);
        }

        let stream = self
            .shared
            .lock_streams()
            .insert(|id| Stream::new(id, format.clone(), options))?;
        let id = stream.id();
        drop(stream);
        log::info!("{}: created for {}", id, format);

        if let Err(e) = self.shared.reconfigure(false) {
            log::error!("{}: output unavailable: {}", id, e);
        }
        self.shared.wake();

        Ok(StreamHandle::new(id, format, Arc::clone(&self.shared)))
    }

    /// Load a WAV file as a sound effect prepared for the current mix format
    pub fn make_sound(&self, path: impl AsRef<Path>) -> EngineResult<SoundEffect> {
        let sound = self.shared.sounds.load(path.as_ref())?;
        Ok(sound)
    }

    /// Subscribe to post-mix audio as interleaved stereo
    ///
    /// The output thread pushes into a ring of `capacity` samples and drops
    /// what doesn't fit. Dropping the consumer unsubscribes; registering
    /// again replaces the previous consumer.
    pub fn register_audio_callback(&self, capacity: usize) -> rtrb::Consumer<f32> {
        let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(2));
        if let Ok(mut slot) = self.shared.viz.lock() {
            *slot = Some(producer);
        }
        log::debug!("Visualization tap registered ({} samples)", capacity);
        consumer
    }

    pub fn unregister_audio_callback(&self) {
        if let Ok(mut slot) = self.shared.viz.lock() {
            *slot = None;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Master controls
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_volume(&self, volume: f32) {
        self.shared.volume.store(volume.clamp(0.0, 1.0));
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume.load()
    }

    pub fn set_mute(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Devices and settings
    // ─────────────────────────────────────────────────────────────────────

    /// `(display_name, device_string)` for every device that can be opened
    pub fn enumerate_output_devices(&self, passthrough: bool) -> Vec<(String, String)> {
        self.shared.registry.enumerate_output_devices(passthrough)
    }

    /// Whether a `bitstream` stream would be passed through untouched
    ///
    /// Needs passthrough enabled for the codec and a passthrough device that
    /// accepts raw data. TrueHD and DTS-HD additionally need an 8-channel
    /// device.
    pub fn supports_raw(&self, bitstream: Bitstream) -> bool {
        self.shared.supports_raw(bitstream)
    }

    pub fn default_device(&self, passthrough: bool) -> Option<String> {
        self.shared.registry.default_device(passthrough)
    }

    pub fn settings(&self) -> EngineSettings {
        self.shared.settings()
    }

    /// Edit settings and apply whatever changed
    pub fn update_settings(&self, edit: impl FnOnce(&mut EngineSettings)) -> EngineResult<()> {
        let changed = {
            let mut settings = self
                .shared
                .settings
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = settings.clone();
            let mut edited = before.clone();
            edit(&mut edited);
            *settings = edited.validated();
            before.changed_keys(&*settings)
        };
        self.apply_changes(&changed)
    }

    /// React to a setting the host changed behind the engine's back
    pub fn on_settings_change(&self, key: SettingKey) -> EngineResult<()> {
        self.apply_changes(&[key])
    }

    fn apply_changes(&self, keys: &[SettingKey]) -> EngineResult<()> {
        for key in keys {
            log::info!("Setting changed: {}", key);
        }
        if !self.is_running() {
            return Ok(());
        }
        if keys.iter().any(SettingKey::reopens_sink) {
            return self.shared.reconfigure(true);
        }
        if keys.iter().any(SettingKey::affects_remap) {
            self.shared.reinitialize_streams();
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    /// Format granted by the open sink
    pub fn output_format(&self) -> Option<AudioFormat> {
        self.shared
            .read_output()
            .sink
            .as_ref()
            .map(|opened| opened.sink.format().clone())
    }

    /// Float format streams are mixed in (none in raw passthrough)
    pub fn mix_format(&self) -> Option<AudioFormat> {
        self.shared.read_output().mix_format.clone()
    }

    /// `"<driver>:<device>"` of the open sink
    pub fn output_device(&self) -> Option<String> {
        self.shared
            .read_output()
            .sink
            .as_ref()
            .map(|opened| format!("{}:{}", opened.driver, opened.device))
    }

    pub fn mode(&self) -> OutputMode {
        self.shared.read_output().mode
    }

    /// Seconds between the mix and the speaker
    pub fn delay(&self) -> f64 {
        self.shared.output_delay()
    }

    /// Streams not yet reaped
    pub fn stream_count(&self) -> usize {
        self.shared.lock_streams().len()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuiSoundMode, SpeakerLayout};
    use crate::encoder::{CodecCapabilities, EncoderError, EncoderSetup};
    use crate::sink::{DeviceInfo, Sink, SinkDriver, SinkError, SinkResult};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Everything written to capture sinks, shared with the test
    #[derive(Clone, Default)]
    struct Capture {
        bytes: Arc<Mutex<Vec<u8>>>,
        opened: Arc<Mutex<Vec<AudioFormat>>>,
    }

    impl Capture {
        fn len(&self) -> usize {
            self.bytes.lock().unwrap().len()
        }

        fn floats(&self) -> Vec<f32> {
            self.bytes
                .lock()
                .unwrap()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        }

        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    struct CaptureDriver {
        devices: Vec<&'static str>,
        capture: Capture,
    }

    struct CaptureSink {
        format: AudioFormat,
        capture: Capture,
    }

    impl SinkDriver for CaptureDriver {
        fn name(&self) -> &str {
            "capture"
        }

        fn create(&self, device: &str, desired: &AudioFormat) -> SinkResult<Box<dyn Sink>> {
            if !self.devices.iter().any(|d| *d == device) {
                return Err(SinkError::DeviceNotFound(device.to_string()));
            }
            self.capture.opened.lock().unwrap().push(desired.clone());
            Ok(Box::new(CaptureSink {
                format: desired.clone(),
                capture: self.capture.clone(),
            }))
        }

        fn enumerate(&self, _force_rescan: bool) -> Vec<DeviceInfo> {
            self.devices
                .iter()
                .map(|name| DeviceInfo {
                    driver: "capture".to_string(),
                    name: name.to_string(),
                    display_name: format!("Capture {}", name),
                    supports_raw: true,
                    is_default: false,
                    max_channels: 8,
                    sample_rates: vec![44100, 48000],
                })
                .collect()
        }
    }

    impl Sink for CaptureSink {
        fn format(&self) -> &AudioFormat {
            &self.format
        }

        fn add_packets(&self, data: &[u8], frames: usize) -> usize {
            let bytes = frames * self.format.frame_size();
            self.capture
                .bytes
                .lock()
                .unwrap()
                .extend_from_slice(&data[..bytes]);
            frames
        }

        fn drain(&self) {}

        fn delay(&self) -> f64 {
            0.0
        }

        fn cache_total(&self) -> f64 {
            0.0
        }
    }

    fn engine_with(settings: EngineSettings) -> (Engine, Capture) {
        engine_with_encoder(settings, default_encoder())
    }

    fn engine_with_encoder(
        settings: EngineSettings,
        encoder: Option<Box<dyn Encoder>>,
    ) -> (Engine, Capture) {
        let capture = Capture::default();
        let mut registry = SinkRegistry::empty();
        registry.register(CaptureDriver {
            devices: vec!["first", "second"],
            capture: capture.clone(),
        });
        let engine = Engine::start_with_encoder(settings, registry, encoder).unwrap();
        (engine, capture)
    }

    /// 5.1 encoder that can be told to fail at setup or on every block
    struct BrokenEncoder {
        fail_initialize: bool,
    }

    impl Encoder for BrokenEncoder {
        fn codec_name(&self) -> &str {
            "broken"
        }

        fn capabilities(&self) -> CodecCapabilities {
            CodecCapabilities {
                sample_formats: vec![SampleFormat::Float],
                sample_rates: Vec::new(),
                layout: ChannelLayout::layout_51(),
                frames_per_call: 256,
            }
        }

        fn initialize(&mut self, format: &AudioFormat) -> Result<EncoderSetup, EncoderError> {
            if self.fail_initialize {
                return Err(EncoderError::NoCompatibleFormat(format.data_format));
            }
            Ok(EncoderSetup {
                input: AudioFormat::new(SampleFormat::Float, format.sample_rate, ChannelLayout::layout_51())
                    .with_frames(256),
                output: AudioFormat::new(
                    SampleFormat::Raw(Bitstream::Ac3),
                    format.sample_rate,
                    ChannelLayout::stereo(),
                )
                .with_encoded_rate(format.sample_rate),
                needs_conversion: false,
            })
        }

        fn encode(&mut self, _data: &[u8], _frames: usize, _out: &mut Vec<u8>) -> Result<usize, EncoderError> {
            Err(EncoderError::EncodeFailed("corrupt block".to_string()))
        }

        fn delay(&self, _pending_bytes: usize) -> f64 {
            0.0
        }

        fn reset(&mut self) {}
    }

    fn surround_stream(engine: &Engine) -> StreamHandle {
        engine
            .make_stream(
                SampleFormat::Float,
                48000,
                None,
                ChannelLayout::layout_51(),
                StreamOptions::default(),
            )
            .unwrap()
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            audio_device: "capture:first".to_string(),
            ..EngineSettings::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn dc(value: f32, frames: usize, channels: usize) -> Vec<u8> {
        std::iter::repeat(value.to_le_bytes())
            .take(frames * channels)
            .flatten()
            .collect()
    }

    fn float_stream(engine: &Engine, rate: u32) -> StreamHandle {
        engine
            .make_stream(
                SampleFormat::Float,
                rate,
                None,
                ChannelLayout::stereo(),
                StreamOptions::default(),
            )
            .unwrap()
    }

    /// 20ms at 44.1kHz
    const PERIOD: usize = 882;

    #[test]
    fn test_idle_engine_opens_stereo_default() {
        let (engine, capture) = engine_with(settings());
        let format = engine.output_format().unwrap();
        assert_eq!(format.sample_rate, 44100);
        assert_eq!(format.layout, ChannelLayout::stereo());
        assert_eq!(format.frames, PERIOD);
        assert_eq!(engine.mode(), OutputMode::Normal);
        assert_eq!(engine.output_device().as_deref(), Some("capture:first"));
        assert_eq!(capture.open_count(), 1);
    }

    #[test]
    fn test_stream_plays_through_to_sink() {
        let (engine, capture) = engine_with(settings());
        let stream = float_stream(&engine, 44100);
        assert_eq!(stream.add_data(&dc(0.5, PERIOD * 3, 2)), PERIOD * 3 * 8);

        assert!(wait_until(|| capture.len() >= PERIOD * 3 * 8));
        let samples = capture.floats();
        assert!(samples.iter().all(|s| (s - 0.5).abs() < 1e-6));
        // Same format as the idle default: no re-open
        assert_eq!(capture.open_count(), 1);
    }

    #[test]
    fn test_missing_device_falls_back_to_first_enumerated() {
        let (engine, _capture) = engine_with(EngineSettings {
            audio_device: "capture:missing".to_string(),
            ..EngineSettings::default()
        });

        let devices = engine.enumerate_output_devices(false);
        assert!(devices.iter().all(|(_, d)| d != "capture:missing"));
        assert_eq!(devices[0].1, "capture:first");
        assert_eq!(engine.output_device().as_deref(), Some("capture:first"));
        assert_eq!(engine.default_device(false).as_deref(), Some("capture:first"));
    }

    #[test]
    fn test_no_device_at_all_fails_start() {
        let registry = SinkRegistry::empty();
        assert!(matches!(
            Engine::start(settings(), registry),
            Err(EngineError::Sink(_))
        ));
    }

    #[test]
    fn test_destroyed_stream_plays_out_then_is_reaped() {
        let (engine, capture) = engine_with(settings());
        let stream = float_stream(&engine, 44100);
        stream.pause();
        stream.add_data(&dc(0.1, PERIOD * 2, 2));
        stream.resume();
        drop(stream);

        assert!(wait_until(|| engine.stream_count() == 0));
        assert_eq!(capture.len(), PERIOD * 2 * 8);
    }

    #[test]
    fn test_destroyed_paused_stream_is_reaped() {
        let (engine, capture) = engine_with(settings());
        let stream = float_stream(&engine, 44100);
        stream.pause();
        stream.add_data(&dc(0.1, PERIOD * 2, 2));
        drop(stream);

        assert!(wait_until(|| engine.stream_count() == 0));
        assert_eq!(capture.len(), 0);
    }

    #[test]
    fn test_master_volume_and_mute() {
        let (engine, capture) = engine_with(settings());
        engine.set_volume(0.5);
        assert_eq!(engine.volume(), 0.5);

        let first = float_stream(&engine, 44100);
        first.add_data(&dc(0.8, PERIOD, 2));
        assert!(wait_until(|| capture.len() >= PERIOD * 8));
        assert!(capture.floats().iter().all(|s| (s - 0.4).abs() < 1e-6));

        engine.set_mute(true);
        assert!(engine.is_muted());
        capture.bytes.lock().unwrap().clear();
        let second = float_stream(&engine, 44100);
        second.add_data(&dc(0.8, PERIOD, 2));
        assert!(wait_until(|| capture.len() >= PERIOD * 8));
        assert!(capture.floats().iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_visualization_tap() {
        let (engine, capture) = engine_with(settings());
        let mut consumer = engine.register_audio_callback(PERIOD * 4);

        let first = float_stream(&engine, 44100);
        first.add_data(&dc(0.3, PERIOD, 2));
        assert!(wait_until(|| capture.len() >= PERIOD * 8));

        assert!(wait_until(|| consumer.slots() >= PERIOD * 2));
        let chunk = consumer.read_chunk(PERIOD * 2).unwrap();
        assert!(chunk.into_iter().all(|s| (s - 0.3).abs() < 1e-6));

        // The next cycle with output notices the consumer is gone
        drop(consumer);
        let second = float_stream(&engine, 44100);
        second.add_data(&dc(0.3, PERIOD, 2));
        assert!(wait_until(|| engine.shared.viz.lock().unwrap().is_none()));
    }

    #[test]
    fn test_new_master_format_reopens_sink() {
        let (engine, capture) = engine_with(settings());
        let _stream = float_stream(&engine, 48000);

        let format = engine.output_format().unwrap();
        assert_eq!(format.sample_rate, 48000);
        assert_eq!(capture.open_count(), 2);
    }

    #[test]
    fn test_settings_changes() {
        let (engine, capture) = engine_with(settings());

        // Remap-only change keeps the sink
        engine.update_settings(|s| s.stereo_upmix = true).unwrap();
        assert_eq!(capture.open_count(), 1);
        assert!(engine.settings().stereo_upmix);

        engine.update_settings(|s| s.sample_rate = Some(48000)).unwrap();
        assert_eq!(capture.open_count(), 2);
        assert_eq!(engine.output_format().unwrap().sample_rate, 48000);

        engine.update_settings(|s| s.audio_device = "capture:second".to_string()).unwrap();
        assert_eq!(engine.output_device().as_deref(), Some("capture:second"));

        engine.on_settings_change(SettingKey::GuiSounds).unwrap();
        assert_eq!(capture.open_count(), 3);
    }

    #[test]
    fn test_settings_are_validated() {
        let (engine, _capture) = engine_with(EngineSettings {
            period_ms: 0,
            ..settings()
        });
        assert_eq!(engine.settings().period_ms, crate::config::MIN_PERIOD_MS);

        engine.update_settings(|s| s.sample_rate = Some(0)).unwrap();
        assert_eq!(engine.settings().sample_rate, None);
        assert_eq!(engine.output_format().unwrap().sample_rate, 44100);
    }

    #[test]
    fn test_raw_passthrough_mode() {
        let (engine, capture) = engine_with(EngineSettings {
            passthrough: true,
            ..settings()
        });

        let stream = engine
            .make_stream(
                SampleFormat::Raw(Bitstream::Ac3),
                48000,
                Some(48000),
                ChannelLayout::stereo(),
                StreamOptions::default(),
            )
            .unwrap();
        assert_eq!(engine.mode(), OutputMode::Raw);
        assert!(engine.mix_format().is_none());

        // 20ms at 48kHz, 4 bytes per raw frame
        let payload: Vec<u8> = (0..960 * 4).map(|i| (i % 253) as u8).collect();
        assert_eq!(stream.add_data(&payload), payload.len());
        assert!(wait_until(|| capture.len() >= payload.len()));
        assert_eq!(*capture.bytes.lock().unwrap(), payload);

        // Back to PCM once the bitstream stream is gone
        drop(stream);
        assert!(wait_until(|| engine.mode() == OutputMode::Normal));
    }

    #[test]
    fn test_passthrough_follows_codec_switches() {
        let (engine, _capture) = engine_with(EngineSettings {
            passthrough: true,
            ..settings()
        });

        let _stream = engine
            .make_stream(
                SampleFormat::Raw(Bitstream::Eac3),
                48000,
                Some(48000),
                ChannelLayout::stereo(),
                StreamOptions::default(),
            )
            .unwrap();
        assert_eq!(engine.mode(), OutputMode::Normal);

        engine.update_settings(|s| s.eac3_passthrough = true).unwrap();
        assert_eq!(engine.mode(), OutputMode::Raw);
        assert!(engine.output_format().unwrap().is_raw());
    }

    #[test]
    fn test_supports_raw() {
        let (engine, _capture) = engine_with(settings());
        assert!(!engine.supports_raw(Bitstream::Ac3));

        engine.update_settings(|s| s.passthrough = true).unwrap();
        assert!(engine.supports_raw(Bitstream::Ac3));
        assert!(engine.supports_raw(Bitstream::Dts));
        assert!(!engine.supports_raw(Bitstream::Eac3));
        assert!(!engine.supports_raw(Bitstream::TrueHd));

        engine.update_settings(|s| s.truehd_passthrough = true).unwrap();
        assert!(engine.supports_raw(Bitstream::TrueHd));

        engine
            .update_settings(|s| s.passthrough_device = "capture:missing".to_string())
            .unwrap();
        assert!(!engine.supports_raw(Bitstream::Ac3));
    }

    #[test]
    fn test_suspend_releases_sink_until_resume() {
        let (engine, capture) = engine_with(settings());
        assert!(engine.suspend());
        assert!(engine.is_suspended());
        assert!(!engine.suspend());
        assert!(engine.output_format().is_none());

        // Nothing re-opens the sink while suspended
        let stream = float_stream(&engine, 48000);
        engine.update_settings(|s| s.sample_rate = Some(48000)).unwrap();
        assert!(engine.output_format().is_none());
        assert_eq!(capture.open_count(), 1);
        assert_eq!(stream.space(), 0);

        engine.resume().unwrap();
        assert!(!engine.is_suspended());
        assert_eq!(engine.output_format().unwrap().sample_rate, 48000);
        assert_eq!(capture.open_count(), 2);

        stream.add_data(&dc(0.5, 960, 2));
        assert!(wait_until(|| capture.len() >= 960 * 8));
        assert!(capture.floats().iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_amplified_stream_stays_within_full_scale() {
        let (engine, capture) = engine_with(settings());
        let stream = float_stream(&engine, 44100);
        stream.set_amplification(3.0);
        assert_eq!(stream.amplification(), 3.0);
        stream.pause();
        stream.add_data(&dc(0.2, PERIOD, 2));
        stream.add_data(&dc(0.9, PERIOD, 2));
        stream.resume();
        assert!(wait_until(|| capture.len() >= PERIOD * 2 * 8));

        let samples = capture.floats();
        let (quiet, loud) = samples.split_at(PERIOD * 2);
        assert!(quiet.iter().all(|s| (s - 0.6).abs() < 1e-5));
        assert!(loud.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_raw_stream_without_passthrough_is_discarded() {
        let (engine, capture) = engine_with(settings());
        let stream = engine
            .make_stream(
                SampleFormat::Raw(Bitstream::Ac3),
                48000,
                Some(48000),
                ChannelLayout::stereo(),
                StreamOptions::default(),
            )
            .unwrap();
        assert_eq!(engine.mode(), OutputMode::Normal);
        stream.add_data(&vec![7u8; 960 * 4]);
        assert!(wait_until(|| stream.cache_time() == 0.0));
        assert_eq!(capture.len(), 0);
    }

    #[cfg(feature = "transcode")]
    #[test]
    fn test_multichannel_stream_is_transcoded() {
        let (engine, capture) = engine_with(EngineSettings {
            transcode: true,
            ..settings()
        });

        let stream = engine
            .make_stream(
                SampleFormat::Float,
                48000,
                None,
                ChannelLayout::layout_51(),
                StreamOptions::default(),
            )
            .unwrap();
        assert_eq!(engine.mode(), OutputMode::Transcode);
        let mix = engine.mix_format().unwrap();
        assert_eq!(mix.channel_count(), 6);
        assert!(engine.output_format().unwrap().is_raw());

        stream.add_data(&dc(0.1, mix.frames * 4, 6));
        assert!(wait_until(|| capture.len() >= 4));
        assert_eq!(&capture.bytes.lock().unwrap()[..4], b"fLaC");
    }

    #[test]
    fn test_encode_failure_falls_back_to_pcm_for_good() {
        let (engine, capture) = engine_with_encoder(
            EngineSettings {
                transcode: true,
                speakers: SpeakerLayout::Surround51,
                ..settings()
            },
            Some(Box::new(BrokenEncoder { fail_initialize: false })),
        );

        let stream = surround_stream(&engine);
        assert_eq!(engine.mode(), OutputMode::Transcode);
        assert!(engine.output_format().unwrap().is_raw());

        stream.add_data(&dc(0.1, 256 * 4, 6));
        assert!(wait_until(|| engine.mode() == OutputMode::Normal));
        let format = engine.output_format().unwrap();
        assert!(!format.is_raw());
        assert_eq!(format.channel_count(), 6);

        // A fresh multichannel master does not retry the broken encoder
        drop(stream);
        assert!(wait_until(|| engine.stream_count() == 0));
        let second = surround_stream(&engine);
        assert_eq!(engine.mode(), OutputMode::Normal);
        capture.bytes.lock().unwrap().clear();
        second.add_data(&dc(0.25, 960, 6));
        assert!(wait_until(|| capture.len() >= 960 * 6 * 4));
        assert!(capture.floats().iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_encoder_setup_failure_mixes_pcm() {
        let (engine, capture) = engine_with_encoder(
            EngineSettings {
                transcode: true,
                speakers: SpeakerLayout::Surround51,
                ..settings()
            },
            Some(Box::new(BrokenEncoder { fail_initialize: true })),
        );

        let stream = surround_stream(&engine);
        assert_eq!(engine.mode(), OutputMode::Normal);
        let format = engine.output_format().unwrap();
        assert!(!format.is_raw());
        assert_eq!(format.data_format, SampleFormat::Float);
        assert_eq!(engine.mix_format().unwrap().channel_count(), 6);

        stream.add_data(&dc(0.2, 960, 6));
        assert!(wait_until(|| capture.len() >= 960 * 6 * 4));
        assert!(capture.floats().iter().all(|s| (s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_sound_effect_plays_and_respects_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("click.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..PERIOD {
            writer.write_sample(8192i16).unwrap();
        }
        writer.finalize().unwrap();

        let (engine, capture) = engine_with(settings());
        let sound = engine.make_sound(&path).unwrap();
        assert!(sound.play());
        assert!(wait_until(|| capture.len() >= PERIOD * 8));
        assert!(capture.floats().iter().any(|s| s.abs() > 0.1));

        engine.update_settings(|s| s.gui_sounds = GuiSoundMode::Never).unwrap();
        capture.bytes.lock().unwrap().clear();
        assert!(sound.play());
        assert!(wait_until(|| !sound.is_playing()));
        assert_eq!(capture.len(), 0);
    }

    #[test]
    fn test_shutdown_stops_engine() {
        let (mut engine, _capture) = engine_with(settings());
        engine.shutdown();
        engine.shutdown();
        assert!(!engine.is_running());
        assert!(engine.output_format().is_none());
        assert!(matches!(
            engine.make_stream(
                SampleFormat::S16LE,
                44100,
                None,
                ChannelLayout::stereo(),
                StreamOptions::default()
            ),
            Err(EngineError::NotRunning)
        ));
    }

    #[test]
    fn test_handle_delay_includes_buffered_audio() {
        let (engine, _capture) = engine_with(settings());
        let stream = float_stream(&engine, 44100);
        stream.pause();
        stream.add_data(&dc(0.0, 4410, 2));
        assert!(stream.delay() >= 0.099);
        assert!(stream.cache_total() > 0.0);
        assert!(stream.is_paused());
    }
}
