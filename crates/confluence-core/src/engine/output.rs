//! The output thread
//!
//! One cycle produces one period:
//!
//! ```text
//!  normal:    streams ─┐
//!                      ├─► mix ─► master gain ─► clamp ─► tap ─► from_float ─► sink
//!             sounds  ─┘
//!  transcode: ... clamp ─► tap ─► from_float ─► encoder ─► sink
//!  raw:       master stream frame ─────────────────────────────────────────► sink
//! ```
//!
//! Bytes for the sink collect in an [`AudioBuffer`] and leave in whole sink
//! periods. `Sink::add_packets` blocking is what paces the loop; when no
//! stream has data the thread waits on the wake channel instead.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use basedrop::Shared;

use super::mix::{apply_master, mix_streams, stereo_tap};
use super::state::{EngineShared, OutputMode, OutputState};
use crate::buffer::AudioBuffer;
use crate::config::GuiSoundMode;
use crate::convert;
use crate::sink::{OpenedSink, Sink};
use crate::stream::{OutputFrame, Stream};
use crate::types::AudioFormat;

/// Idle wait when no sink is open
const NO_SINK_WAIT: Duration = Duration::from_millis(100);

/// Period assumed for sinks that report none
const FALLBACK_PERIOD_MS: u32 = 20;

fn sink_period_bytes(format: &AudioFormat) -> usize {
    let frames = if format.frames > 0 {
        format.frames
    } else {
        AudioFormat::frames_for_ms(format.sample_rate, FALLBACK_PERIOD_MS)
    };
    frames * format.frame_size().max(1)
}

/// Queue `bytes` for the sink and hand over what is ready
///
/// PCM and passthrough output leave in whole sink periods. Encoded output
/// (`whole_periods == false`) leaves as soon as a whole frame is queued,
/// since compressed packets can be far smaller than a period.
fn write_sink(pending: &mut AudioBuffer, sink: &dyn Sink, bytes: &[u8], whole_periods: bool) {
    let format = sink.format();
    let frame_size = format.frame_size().max(1);
    let period = sink_period_bytes(format);

    let mut offset = 0;
    while offset < bytes.len() {
        let n = (bytes.len() - offset).min(pending.free());
        pending.push(&bytes[offset..offset + n]);
        offset += n;

        loop {
            let ready = if whole_periods {
                if pending.used() < period {
                    break;
                }
                period
            } else {
                let whole = (pending.used() / frame_size) * frame_size;
                if whole == 0 {
                    break;
                }
                whole.min(period)
            };

            let accepted = sink.add_packets(&pending.as_slice()[..ready], ready / frame_size);
            if accepted == 0 {
                log::warn!("Sink accepted nothing, dropping {} bytes", ready);
                pending.shift(None, ready);
            } else {
                pending.shift(None, (accepted * frame_size).min(ready));
            }
        }
    }
}

pub(crate) struct OutputWorker {
    shared: Arc<EngineShared>,
    generation: u64,
    idle_wait: Duration,
    streams: Vec<Shared<Stream>>,
    mix: Vec<f32>,
    tap: Vec<f32>,
    converted: Vec<u8>,
    encoded: Vec<u8>,
    pending: AudioBuffer,
}

impl OutputWorker {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self {
            shared,
            generation: u64::MAX,
            idle_wait: NO_SINK_WAIT,
            streams: Vec::new(),
            mix: Vec::new(),
            tap: Vec::new(),
            converted: Vec::new(),
            encoded: Vec::new(),
            pending: AudioBuffer::new(),
        }
    }

    pub(crate) fn run(mut self) {
        log::info!("Output thread started");

        while self.shared.running.load(Ordering::Acquire) {
            if self.shared.reconfigure_requested.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.shared.reconfigure(false) {
                    log::error!("Output reconfigure failed: {}", e);
                }
            }

            if !self.cycle() {
                self.shared.wait_for_work(self.idle_wait);
            }
        }

        self.streams.clear();
        log::info!("Output thread stopped");
    }

    /// Run one cycle; false if there was nothing to output
    fn cycle(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let output = shared.read_output();
        let Some(opened) = output.sink.as_ref() else {
            self.idle_wait = NO_SINK_WAIT;
            return false;
        };

        let generation = shared.generation.load(Ordering::Acquire);
        if generation != self.generation {
            self.resize(&output, opened);
            self.generation = generation;
        }

        self.collect_streams(&output);

        let produced = match output.mode {
            OutputMode::Raw => self.cycle_raw(&output, opened),
            OutputMode::Normal | OutputMode::Transcode => self.cycle_mix(&output, opened),
        };
        shared.queued_bytes.store(self.pending.used(), Ordering::Relaxed);
        produced
    }

    fn resize(&mut self, output: &OutputState, opened: &OpenedSink) {
        let period = sink_period_bytes(opened.sink.format());
        self.pending.alloc(period * 2);

        let seconds = match &output.mix_format {
            Some(mix) => {
                self.mix.reserve(mix.frames * mix.channel_count());
                mix.period_seconds()
            }
            None => opened.sink.format().period_seconds(),
        };
        self.idle_wait = Duration::from_secs_f64(seconds.clamp(0.001, 0.1));

        log::debug!(
            "Output buffers: {} bytes per sink period, idle wait {:?}",
            period,
            self.idle_wait
        );
    }

    /// Snapshot live streams and reap finished ones
    fn collect_streams(&mut self, output: &OutputState) {
        let mut arena = self.shared.lock_streams();
        let reaped = arena.reap();
        arena.snapshot(&mut self.streams);
        drop(arena);

        if output.master.is_some_and(|master| reaped.contains(&master)) {
            self.shared.reconfigure_requested.store(true, Ordering::Release);
        }
    }

    fn cycle_raw(&mut self, output: &OutputState, opened: &OpenedSink) -> bool {
        self.shared.sounds.discard_plays();

        let mut frame = None;
        for stream in &self.streams {
            let pulled = stream.get_frame();
            if Some(stream.id()) == output.master {
                if let Some(OutputFrame::Raw(bytes)) = pulled {
                    frame = Some(bytes);
                }
            }
        }

        match frame {
            Some(bytes) => {
                write_sink(&mut self.pending, opened.sink.as_ref(), &bytes, true);
                true
            }
            None => false,
        }
    }

    fn cycle_mix(&mut self, output: &OutputState, opened: &OpenedSink) -> bool {
        let Some(format) = output.mix_format.as_ref() else {
            return false;
        };
        let channels = format.channel_count();
        self.mix.clear();
        self.mix.resize(format.frames * channels, 0.0);

        let mut produced = mix_streams(&self.streams, &mut self.mix, channels);

        let gui_sounds = self
            .shared
            .settings
            .read()
            .map(|s| s.gui_sounds)
            .unwrap_or_default();
        let streams_playing = self
            .streams
            .iter()
            .any(|s| !s.format().is_raw() && !s.is_paused() && !s.is_drained());
        let sounds_allowed = match gui_sounds {
            GuiSoundMode::Always => true,
            GuiSoundMode::Never => false,
            GuiSoundMode::WhenIdle => !streams_playing,
        };
        if sounds_allowed {
            produced |= self.shared.sounds.mix_into(&mut self.mix, channels);
        } else {
            self.shared.sounds.discard_plays();
        }

        if !produced {
            return false;
        }

        apply_master(&mut self.mix, self.shared.master_gain());
        self.publish_tap(channels);

        if output.mode == OutputMode::Transcode {
            self.encode(output, opened);
        } else {
            let data_format = opened.sink.format().data_format;
            self.converted.clear();
            if let Err(e) = convert::from_float(&self.mix, data_format, &mut self.converted) {
                log::error!("Output conversion failed: {}", e);
                return true;
            }
            write_sink(&mut self.pending, opened.sink.as_ref(), &self.converted, true);
        }
        true
    }

    fn encode(&mut self, output: &OutputState, opened: &OpenedSink) {
        let (Some(setup), Some(encoder)) = (output.encoder_setup.as_ref(), output.encoder.as_ref())
        else {
            return;
        };

        self.converted.clear();
        if let Err(e) = convert::from_float(&self.mix, setup.input.data_format, &mut self.converted) {
            log::error!("Transcode input conversion failed: {}", e);
            return;
        }

        self.encoded.clear();
        let result = encoder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .encode(&self.converted, setup.frames_per_call(), &mut self.encoded);

        match result {
            Ok(0) => {}
            Ok(_) => write_sink(&mut self.pending, opened.sink.as_ref(), &self.encoded, false),
            Err(e) => {
                log::error!("Encoder failed, abandoning transcode: {}", e);
                self.shared.transcode_failed.store(true, Ordering::Release);
                self.shared.reconfigure_requested.store(true, Ordering::Release);
            }
        }
    }

    /// Feed the visualization queue; never blocks, drops what doesn't fit
    fn publish_tap(&mut self, channels: usize) {
        let Ok(mut slot) = self.shared.viz.try_lock() else {
            return;
        };
        let Some(producer) = slot.as_mut() else {
            return;
        };
        if producer.is_abandoned() {
            *slot = None;
            log::debug!("Visualization consumer dropped, tap released");
            return;
        }

        stereo_tap(&self.mix, channels, &mut self.tap);
        // Whole stereo frames only
        let n = producer.slots().min(self.tap.len()) & !1;
        if n == 0 {
            return;
        }
        if let Ok(chunk) = producer.write_chunk_uninit(n) {
            chunk.fill_from_iter(self.tap.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use crate::types::{ChannelLayout, SampleFormat};

    #[test]
    fn test_write_sink_hands_over_whole_periods() {
        let format = AudioFormat::new(SampleFormat::S16LE, 48000, ChannelLayout::stereo()).with_frames(64);
        let sink = NullSink::new(format.clone());
        let mut pending = AudioBuffer::with_capacity(sink_period_bytes(&format) * 2);

        // One and a half periods
        write_sink(&mut pending, &sink, &vec![0u8; 64 * 4 + 32 * 4], true);
        assert_eq!(pending.used(), 32 * 4);

        // Completing the second period empties the buffer
        write_sink(&mut pending, &sink, &vec![0u8; 32 * 4], true);
        assert_eq!(pending.used(), 0);
    }

    #[test]
    fn test_write_sink_encoded_keeps_only_partial_frame() {
        let format = AudioFormat::new(SampleFormat::S16LE, 48000, ChannelLayout::stereo()).with_frames(64);
        let sink = NullSink::new(format.clone());
        let mut pending = AudioBuffer::with_capacity(sink_period_bytes(&format) * 2);

        write_sink(&mut pending, &sink, &[1u8; 10], false);
        assert_eq!(pending.used(), 2);
        write_sink(&mut pending, &sink, &[1u8; 2], false);
        assert_eq!(pending.used(), 0);
    }

    #[test]
    fn test_sink_period_fallback() {
        let format = AudioFormat::new(SampleFormat::Float, 48000, ChannelLayout::stereo());
        assert_eq!(sink_period_bytes(&format), 960 * 8);
    }
}
