//! Null sink: discards audio at real-time pace
//!
//! Models a device with a fixed amount of buffering that drains with the
//! wall clock. Writes beyond that buffer sleep, which gives the output
//! thread the same pacing it would get from hardware.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use super::{DeviceInfo, Sink, SinkDriver, SinkError, SinkResult};
use crate::types::AudioFormat;

/// Device name offered by the null driver
pub const NULL_DEVICE: &str = "default";

/// Periods of virtual buffering
const BUFFER_PERIODS: usize = 4;

/// Default period length when the desired format does not specify one
const DEFAULT_PERIOD_MS: u32 = 20;

/// Driver for the null sink
#[derive(Debug, Default)]
pub struct NullDriver;

impl NullDriver {
    pub fn new() -> Self {
        Self
    }
}

impl SinkDriver for NullDriver {
    fn name(&self) -> &str {
        "null"
    }

    fn create(&self, device: &str, desired: &AudioFormat) -> SinkResult<Box<dyn Sink>> {
        if !device.is_empty() && device != NULL_DEVICE {
            return Err(SinkError::DeviceNotFound(device.to_string()));
        }
        if !desired.is_valid() {
            return Err(SinkError::UnsupportedFormat(desired.to_string()));
        }

        let mut format = desired.clone();
        if format.frames == 0 {
            format.frames = AudioFormat::frames_for_ms(format.sample_rate, DEFAULT_PERIOD_MS);
        }
        Ok(Box::new(NullSink::new(format)))
    }

    fn enumerate(&self, _force_rescan: bool) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            driver: "null".to_string(),
            name: NULL_DEVICE.to_string(),
            display_name: "Null output (discard)".to_string(),
            supports_raw: true,
            is_default: false,
            max_channels: 8,
            sample_rates: vec![44100, 48000, 88200, 96000, 192000],
        }]
    }
}

#[derive(Debug)]
struct VirtualClock {
    /// Seconds of audio "in the device"
    level: f64,
    last: Instant,
}

impl VirtualClock {
    fn advance(&mut self) {
        let now = Instant::now();
        self.level = (self.level - now.duration_since(self.last).as_secs_f64()).max(0.0);
        self.last = now;
    }
}

/// Null output sink
#[derive(Debug)]
pub struct NullSink {
    format: AudioFormat,
    capacity: f64,
    clock: Mutex<VirtualClock>,
}

impl NullSink {
    pub fn new(format: AudioFormat) -> Self {
        let capacity = format.period_seconds() * BUFFER_PERIODS as f64;
        Self {
            format,
            capacity,
            clock: Mutex::new(VirtualClock {
                level: 0.0,
                last: Instant::now(),
            }),
        }
    }

    fn level(&self) -> f64 {
        match self.clock.lock() {
            Ok(mut clock) => {
                clock.advance();
                clock.level
            }
            Err(_) => 0.0,
        }
    }
}

impl Sink for NullSink {
    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn add_packets(&self, _data: &[u8], frames: usize) -> usize {
        let duration = frames as f64 / self.format.sample_rate as f64;

        let overflow = self.level() + duration - self.capacity;
        if overflow > 0.0 {
            thread::sleep(Duration::from_secs_f64(overflow));
        }

        if let Ok(mut clock) = self.clock.lock() {
            clock.advance();
            clock.level += duration;
        }
        frames
    }

    fn drain(&self) {
        let remaining = self.level();
        if remaining > 0.0 {
            thread::sleep(Duration::from_secs_f64(remaining));
        }
        if let Ok(mut clock) = self.clock.lock() {
            clock.level = 0.0;
            clock.last = Instant::now();
        }
    }

    fn delay(&self) -> f64 {
        self.level()
    }

    fn cache_total(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelLayout, SampleFormat};

    fn open(frames: usize) -> Box<dyn Sink> {
        let desired = AudioFormat::new(SampleFormat::Float, 48000, ChannelLayout::stereo())
            .with_frames(frames);
        NullDriver::new().create(NULL_DEVICE, &desired).unwrap()
    }

    #[test]
    fn test_unknown_device_rejected() {
        let desired = AudioFormat::new(SampleFormat::Float, 48000, ChannelLayout::stereo());
        assert!(matches!(
            NullDriver::new().create("hdmi", &desired),
            Err(SinkError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_period_defaulted() {
        let sink = open(0);
        assert_eq!(sink.format().frames, 960);
    }

    #[test]
    fn test_buffer_fills_then_paces() {
        let sink = open(480); // 10ms periods, 40ms buffer
        let data = vec![0u8; 480 * 8];

        let start = Instant::now();
        for _ in 0..4 {
            assert_eq!(sink.add_packets(&data, 480), 480);
        }
        // Filling the virtual buffer does not block
        assert!(start.elapsed() < Duration::from_millis(30));
        assert!(sink.delay() > 0.02);

        // Further writes wait for the clock
        for _ in 0..3 {
            sink.add_packets(&data, 480);
        }
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_drain_empties() {
        let sink = open(480);
        sink.add_packets(&vec![0u8; 480 * 8], 480);
        sink.drain();
        assert!(sink.delay() < 0.001);
    }
}
