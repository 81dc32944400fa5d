//! CPAL hardware sink
//!
//! Enumerates output devices across every available CPAL host and plays the
//! engine output through an f32 output stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  add_packets()   ┌─────────────────────┐
//! │  Output Thread   │─────push()──────►│   Sample Ring       │
//! │ (engine, paced)  │  sleeps if full  │  (lock-free SPSC)   │
//! └──────────────────┘                  └──────────┬──────────┘
//!                                                  │ pop()
//!                                                  ▼
//!                                       ┌─────────────────────┐
//!                                       │  CPAL Audio Thread  │
//!                                       │ silence on underrun │
//!                                       └─────────────────────┘
//! ```
//!
//! `cpal::Stream` is not `Send` on every platform, so it lives on a small
//! owner thread for the sink's lifetime and is dropped there.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{HostId, StreamConfig};
use crossbeam::channel::{bounded, Sender};
use rtrb::{Producer, RingBuffer};

use super::{DeviceInfo, Sink, SinkDriver, SinkError, SinkResult};
use crate::convert;
use crate::types::{AudioFormat, ChannelLayout, SampleFormat, DEFAULT_SAMPLE_RATE};

/// Periods of ring buffering between the output thread and the callback
const RING_PERIODS: usize = 4;

/// Separator between host and device name in a device id
const HOST_SEPARATOR: char = '|';

/// Longest time `add_packets` waits for ring space before dropping audio
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Get a human-readable name for a host ID
fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        _ => name,
    }
}

/// Find a device by `"<HOST>|<name>"` id (or bare name, searching all hosts)
fn find_device(id: &str) -> SinkResult<cpal::Device> {
    let (host_filter, name) = match id.split_once(HOST_SEPARATOR) {
        Some((host, name)) => (Some(host), name),
        None => (None, id),
    };

    for host_id in cpal::available_hosts() {
        if host_filter.is_some_and(|h| h != host_name(host_id)) {
            continue;
        }
        let Ok(host) = cpal::host_from_id(host_id) else {
            continue;
        };
        if name == "default" {
            if let Some(device) = host.default_output_device() {
                return Ok(device);
            }
        }
        if let Ok(mut devices) = host.output_devices() {
            if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                return Ok(device);
            }
        }
    }
    Err(SinkError::DeviceNotFound(id.to_string()))
}

/// Pick a stream configuration close to `desired`
///
/// Prefers f32 with enough channels at the desired rate; falls back to the
/// widest f32 config and the device's max rate.
fn negotiate_config(
    device: &cpal::Device,
    desired: &AudioFormat,
) -> SinkResult<cpal::SupportedStreamConfig> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| SinkError::ConfigError(e.to_string()))?
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .collect();

    if supported.is_empty() {
        return Err(SinkError::UnsupportedFormat(
            "device has no f32 output configuration".to_string(),
        ));
    }

    let target_rate = if desired.sample_rate > 0 {
        desired.sample_rate
    } else {
        DEFAULT_SAMPLE_RATE
    };
    let target_channels = desired.channel_count() as u16;
    let rate_ok = |c: &&cpal::SupportedStreamConfigRange| {
        target_rate >= c.min_sample_rate().0 && target_rate <= c.max_sample_rate().0
    };

    let best = supported
        .iter()
        .filter(rate_ok)
        .find(|c| c.channels() == target_channels)
        .or_else(|| {
            supported
                .iter()
                .filter(rate_ok)
                .filter(|c| c.channels() >= target_channels)
                .min_by_key(|c| c.channels())
        })
        .or_else(|| supported.iter().filter(rate_ok).max_by_key(|c| c.channels()))
        .or_else(|| supported.iter().max_by_key(|c| c.channels()))
        .ok_or_else(|| SinkError::ConfigError("No suitable output configuration".to_string()))?;

    let sample_rate = if rate_ok(&best) {
        cpal::SampleRate(target_rate)
    } else {
        let fallback = best.max_sample_rate();
        log::warn!(
            "CPAL sink: device doesn't support {}Hz, falling back to {}Hz (streams will be resampled)",
            target_rate,
            fallback.0
        );
        fallback
    };

    Ok(best.clone().with_sample_rate(sample_rate))
}

/// Driver for CPAL hardware outputs
#[derive(Debug, Default)]
pub struct CpalDriver;

impl CpalDriver {
    pub fn new() -> Self {
        Self
    }
}

impl SinkDriver for CpalDriver {
    fn name(&self) -> &str {
        "cpal"
    }

    fn create(&self, device: &str, desired: &AudioFormat) -> SinkResult<Box<dyn Sink>> {
        if desired.is_raw() {
            return Err(SinkError::UnsupportedFormat(format!(
                "{} passthrough is not available on CPAL outputs",
                desired.data_format
            )));
        }
        Ok(Box::new(CpalSink::open(device, desired)?))
    }

    fn enumerate(&self, _force_rescan: bool) -> Vec<DeviceInfo> {
        let mut all_devices = Vec::new();

        for host_id in cpal::available_hosts() {
            let host = match cpal::host_from_id(host_id) {
                Ok(h) => h,
                Err(e) => {
                    log::debug!("Could not initialize host {:?}: {}", host_id, e);
                    continue;
                }
            };
            let host_label = host_name(host_id);
            let default_name = host.default_output_device().and_then(|d| d.name().ok());

            let devices = match host.output_devices() {
                Ok(d) => d,
                Err(e) => {
                    log::debug!("Could not enumerate devices for {:?}: {}", host_id, e);
                    continue;
                }
            };

            for device in devices {
                let Ok(name) = device.name() else {
                    continue;
                };
                let configs: Vec<_> = match device.supported_output_configs() {
                    Ok(c) => c.collect(),
                    Err(_) => continue,
                };
                if configs.is_empty() {
                    continue;
                }

                let mut sample_rates: Vec<u32> = Vec::new();
                let mut max_channels = 0usize;
                for config in &configs {
                    max_channels = max_channels.max(config.channels() as usize);
                    for rate in [44100, 48000, 88200, 96000, 176400, 192000] {
                        if rate >= config.min_sample_rate().0
                            && rate <= config.max_sample_rate().0
                            && !sample_rates.contains(&rate)
                        {
                            sample_rates.push(rate);
                        }
                    }
                }
                sample_rates.sort();

                all_devices.push(DeviceInfo {
                    driver: "cpal".to_string(),
                    name: format!("{}{}{}", host_label, HOST_SEPARATOR, name),
                    display_name: format!("[{}] {}", host_label, name),
                    supports_raw: false,
                    is_default: default_name.as_ref() == Some(&name),
                    max_channels,
                    sample_rates,
                });
            }
        }

        // Default devices first
        all_devices.sort_by(|a, b| b.is_default.cmp(&a.is_default));
        log::debug!("CPAL: enumerated {} output devices", all_devices.len());
        all_devices
    }
}

/// CPAL output sink
pub struct CpalSink {
    format: AudioFormat,
    producer: Mutex<Producer<f32>>,
    ring_capacity: usize,
    /// Set by the stream error callback
    failed: Arc<AtomicBool>,
    /// Samples the callback had to fill with silence
    underruns: Arc<AtomicUsize>,
    stop_tx: Sender<()>,
    owner: Option<JoinHandle<()>>,
}

impl CpalSink {
    pub fn open(device_id: &str, desired: &AudioFormat) -> SinkResult<Self> {
        let device = find_device(device_id)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let supported = negotiate_config(&device, desired)?;

        let channels = supported.channels() as usize;
        let sample_rate = supported.sample_rate().0;
        let frames = if desired.frames > 0 {
            desired.frames
        } else {
            AudioFormat::frames_for_ms(sample_rate, 20)
        };

        let layout = if channels == desired.channel_count() {
            desired.layout.clone()
        } else {
            ChannelLayout::from_count(channels)
        };
        let format = AudioFormat::new(SampleFormat::Float, sample_rate, layout).with_frames(frames);

        let stream_config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring_capacity = frames * channels * RING_PERIODS;
        let (producer, consumer) = RingBuffer::<f32>::new(ring_capacity);
        let failed = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicUsize::new(0));

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<SinkResult<()>>(1);

        let owner = {
            let failed = failed.clone();
            let underruns = underruns.clone();
            thread::Builder::new()
                .name("cpal-output".to_string())
                .spawn(move || {
                    let mut consumer = consumer;
                    let error_flag = failed.clone();
                    let stream = device.build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                            let mut missing = 0;
                            for sample in data.iter_mut() {
                                *sample = match consumer.pop() {
                                    Ok(s) => s,
                                    Err(_) => {
                                        missing += 1;
                                        0.0
                                    }
                                };
                            }
                            if missing > 0 {
                                underruns.fetch_add(missing, Ordering::Relaxed);
                            }
                        },
                        move |err| {
                            log::error!("CPAL output stream error: {}", err);
                            error_flag.store(true, Ordering::Relaxed);
                        },
                        None,
                    );

                    let stream = match stream {
                        Ok(s) => s,
                        Err(e) => {
                            let _ = ready_tx.send(Err(SinkError::StreamBuildError(e.to_string())));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(SinkError::StreamPlayError(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    // Park until the sink is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("CPAL output stream closed");
                })
                .map_err(|e| SinkError::StreamBuildError(e.to_string()))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = owner.join();
                return Err(e);
            }
            Err(_) => {
                return Err(SinkError::StreamBuildError(
                    "output thread exited during setup".to_string(),
                ))
            }
        }

        log::info!(
            "CPAL sink: {} on '{}' (~{:.1}ms ring)",
            format,
            device_name,
            frames as f64 * RING_PERIODS as f64 * 1000.0 / sample_rate as f64
        );

        Ok(Self {
            format,
            producer: Mutex::new(producer),
            ring_capacity,
            failed,
            underruns,
            stop_tx,
            owner: Some(owner),
        })
    }

    /// Samples the device had to fill with silence so far
    pub fn underrun_samples(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }
}

impl Sink for CpalSink {
    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn add_packets(&self, data: &[u8], frames: usize) -> usize {
        let channels = self.format.channel_count();
        let mut samples = Vec::with_capacity(frames * channels);
        let len = (frames * self.format.frame_size()).min(data.len());
        if convert::to_float(&data[..len], SampleFormat::Float, &mut samples).is_err() {
            return 0;
        }

        let Ok(mut producer) = self.producer.lock() else {
            return 0;
        };

        let mut written = 0;
        let mut waited = Duration::ZERO;
        let step = Duration::from_millis(1);
        while written < samples.len() {
            if self.failed.load(Ordering::Relaxed) {
                break;
            }
            let free = producer.slots();
            if free == 0 {
                if waited >= WRITE_TIMEOUT {
                    log::warn!("CPAL sink: device stalled, dropping {} samples", samples.len() - written);
                    break;
                }
                thread::sleep(step);
                waited += step;
                continue;
            }
            let n = free.min(samples.len() - written);
            for &s in &samples[written..written + n] {
                // Slot availability was just checked
                let _ = producer.push(s);
            }
            written += n;
        }
        written / channels.max(1)
    }

    fn drain(&self) {
        let mut waited = Duration::ZERO;
        while self.delay() > 0.0 && waited < WRITE_TIMEOUT && !self.failed.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(2));
            waited += Duration::from_millis(2);
        }
    }

    fn delay(&self) -> f64 {
        let queued = match self.producer.lock() {
            Ok(producer) => self.ring_capacity - producer.slots(),
            Err(_) => 0,
        };
        queued as f64 / (self.format.sample_rate as f64 * self.format.channel_count() as f64)
    }

    fn cache_total(&self) -> f64 {
        self.ring_capacity as f64
            / (self.format.sample_rate as f64 * self.format.channel_count() as f64)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(owner) = self.owner.take() {
            let _ = owner.join();
        }
    }
}
