//! Output sinks
//!
//! A sink is the engine's only view of an output device. Drivers are
//! registered by name in a [`SinkRegistry`] and addressed with device strings
//! of the form `"<driver>:<device>"`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  get_sink("cpal:ALSA|default", desired)
//! │   Engine Core    │─────────────────────────────┐
//! └────────┬─────────┘                             ▼
//!          │ add_packets()            ┌─────────────────────────┐
//!          │ (may block = pacing)     │      SinkRegistry       │
//!          ▼                          │  null │ wav │ cpal │ …  │
//! ┌──────────────────┐   create()     └────────────┬────────────┘
//! │  Box<dyn Sink>   │◄────────────────────────────┘
//! │ granted format   │   falls back to the first enumerated device
//! └──────────────────┘
//! ```
//!
//! The *granted* format returned by [`Sink::format`] may differ from the
//! desired one (rate, layout, sample encoding); callers must reconcile.

mod error;
mod null;
mod registry;
mod wav;

#[cfg(feature = "cpal-backend")]
mod cpal_sink;

pub use error::{SinkError, SinkResult};
pub use null::{NullDriver, NullSink};
pub use registry::{OpenedSink, SinkRegistry};
pub use wav::WavDriver;

#[cfg(feature = "cpal-backend")]
pub use cpal_sink::CpalDriver;

use crate::types::AudioFormat;

/// Information about an output device offered by a driver
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Driver name (registry key)
    pub driver: String,
    /// Device identifier within the driver
    pub name: String,
    /// Human-readable label
    pub display_name: String,
    /// Whether raw bitstreams can be sent untouched
    pub supports_raw: bool,
    /// Whether this is the driver's default device
    pub is_default: bool,
    /// Maximum output channels
    pub max_channels: usize,
    /// Supported sample rates (common ones)
    pub sample_rates: Vec<u32>,
}

impl DeviceInfo {
    /// Full `"<driver>:<device>"` address
    pub fn device_string(&self) -> String {
        format!("{}:{}", self.driver, self.name)
    }
}

/// An opened output device
///
/// Methods take `&self`: the engine writes through a shared lock while
/// re-opening takes it exclusively, so sinks keep any mutable state behind
/// their own interior locks.
pub trait Sink: Send + Sync {
    /// Format granted by the device
    fn format(&self) -> &AudioFormat;

    /// Write `frames` frames from `data`; returns frames accepted
    ///
    /// May block to pace output to the device clock.
    fn add_packets(&self, data: &[u8], frames: usize) -> usize;

    /// Block until pending device buffers have played out
    fn drain(&self);

    /// Seconds of audio buffered ahead of the speaker
    fn delay(&self) -> f64;

    /// Total buffering capacity in seconds
    fn cache_total(&self) -> f64;
}

/// A registered sink implementation
pub trait SinkDriver: Send + Sync {
    /// Registry key, used as the device string prefix
    fn name(&self) -> &str;

    /// Open `device` asking for `desired`
    fn create(&self, device: &str, desired: &AudioFormat) -> SinkResult<Box<dyn Sink>>;

    /// List the devices this driver can open
    fn enumerate(&self, force_rescan: bool) -> Vec<DeviceInfo>;

    /// Release driver-global resources at engine shutdown
    fn cleanup(&self) {}
}
