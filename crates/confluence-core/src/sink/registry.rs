//! Sink driver registry and device fallback

use super::{DeviceInfo, NullDriver, Sink, SinkDriver, SinkError, SinkResult, WavDriver};
use crate::types::AudioFormat;

/// A sink together with the address it was actually opened at
pub struct OpenedSink {
    pub sink: Box<dyn Sink>,
    pub driver: String,
    pub device: String,
}

impl std::fmt::Debug for OpenedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSink")
            .field("driver", &self.driver)
            .field("device", &self.device)
            .field("format", self.sink.format())
            .finish()
    }
}

/// Table of sink drivers keyed by name
///
/// Registration order matters: it is the enumeration order, and the first
/// enumerated device is the fallback when a requested device cannot be
/// opened.
pub struct SinkRegistry {
    drivers: Vec<Box<dyn SinkDriver>>,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SinkRegistry {
    /// Registry with no drivers
    pub fn empty() -> Self {
        Self { drivers: Vec::new() }
    }

    /// Registry with the built-in drivers
    ///
    /// Hardware output (when compiled in) comes first so it wins the
    /// fallback; the null sink is always present as a last resort.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        #[cfg(feature = "cpal-backend")]
        registry.register(super::CpalDriver::new());
        registry.register(NullDriver::new());
        registry.register(WavDriver::new());
        registry
    }

    /// Add a driver, replacing any driver with the same name
    pub fn register<D: SinkDriver + 'static>(&mut self, driver: D) {
        let name = driver.name().to_string();
        if let Some(slot) = self.drivers.iter_mut().find(|d| d.name() == name) {
            log::info!("Sink registry: replacing driver '{}'", name);
            *slot = Box::new(driver);
        } else {
            log::debug!("Sink registry: registered driver '{}'", name);
            self.drivers.push(Box::new(driver));
        }
    }

    pub fn driver(&self, name: &str) -> Option<&dyn SinkDriver> {
        self.drivers
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    pub fn driver_names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Split a device string into `(driver, device)`
    ///
    /// A prefix that names a registered driver selects it. Anything else is
    /// a device of `previous_driver` (or of the first registered driver).
    pub fn parse_device(&self, device: &str, previous_driver: Option<&str>) -> (String, String) {
        if let Some((prefix, rest)) = device.split_once(':') {
            if self.driver(prefix).is_some() {
                return (prefix.to_string(), rest.to_string());
            }
        }

        let driver = previous_driver
            .filter(|name| self.driver(name).is_some())
            .or_else(|| self.drivers.first().map(|d| d.name()))
            .unwrap_or_default();
        (driver.to_string(), device.to_string())
    }

    /// All devices of all drivers, in registration order
    pub fn enumerate(&self, force_rescan: bool) -> Vec<DeviceInfo> {
        self.drivers
            .iter()
            .flat_map(|d| d.enumerate(force_rescan))
            .collect()
    }

    /// `(display_name, device_string)` pairs for a device picker
    ///
    /// With `passthrough`, only devices able to carry raw bitstreams.
    pub fn enumerate_output_devices(&self, passthrough: bool) -> Vec<(String, String)> {
        self.enumerate(false)
            .into_iter()
            .filter(|d| !passthrough || d.supports_raw)
            .map(|d| (d.display_name.clone(), d.device_string()))
            .collect()
    }

    /// Default device string: a driver-flagged default, else the first device
    pub fn default_device(&self, passthrough: bool) -> Option<String> {
        let devices: Vec<DeviceInfo> = self
            .enumerate(false)
            .into_iter()
            .filter(|d| !passthrough || d.supports_raw)
            .collect();
        devices
            .iter()
            .find(|d| d.is_default)
            .or_else(|| devices.first())
            .map(|d| d.device_string())
    }

    /// Open `device`, falling back to the first enumerated device that opens
    pub fn get_sink(
        &self,
        device: &str,
        desired: &AudioFormat,
        previous_driver: Option<&str>,
    ) -> SinkResult<OpenedSink> {
        let (driver_name, device_name) = self.parse_device(device, previous_driver);

        let mut last_error = match self.driver(&driver_name) {
            Some(driver) => match driver.create(&device_name, desired) {
                Ok(sink) => {
                    log::info!(
                        "Sink opened: {}:{} requested {} granted {}",
                        driver_name,
                        device_name,
                        desired,
                        sink.format()
                    );
                    return Ok(OpenedSink {
                        sink,
                        driver: driver_name,
                        device: device_name,
                    });
                }
                Err(e) => e,
            },
            None => SinkError::DriverNotFound(driver_name.clone()),
        };

        log::warn!(
            "Sink: could not open '{}' ({}), trying enumerated devices",
            device,
            last_error
        );

        for info in self.enumerate(false) {
            if info.driver == driver_name && info.name == device_name {
                continue;
            }
            if desired.is_raw() && !info.supports_raw {
                continue;
            }
            let Some(driver) = self.driver(&info.driver) else {
                continue;
            };
            match driver.create(&info.name, desired) {
                Ok(sink) => {
                    log::info!(
                        "Sink fallback: opened {} requested {} granted {}",
                        info.device_string(),
                        desired,
                        sink.format()
                    );
                    return Ok(OpenedSink {
                        sink,
                        driver: info.driver,
                        device: info.name,
                    });
                }
                Err(e) => {
                    log::warn!("Sink fallback: {} failed: {}", info.device_string(), e);
                    last_error = e;
                }
            }
        }

        log::error!("Sink: no usable output device ({})", last_error);
        Err(last_error)
    }

    /// Run every driver's cleanup hook
    pub fn cleanup(&self) {
        for driver in &self.drivers {
            driver.cleanup();
        }
    }
}
