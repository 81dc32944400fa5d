//! Engine settings
//!
//! Everything the engine reads from the host's configuration, as one serde
//! struct that can live in its own YAML file or inside a host's config:
//!
//! ```yaml
//! audio_device: "cpal:ALSA|default"
//! speakers: "5.1"
//! passthrough: true
//! gui_sounds: when_idle
//! ```
//!
//! Hosts change settings through `Engine::update_settings` or by editing the
//! file and calling `Engine::on_settings_change` with the affected
//! [`SettingKey`].

mod io;
mod paths;

pub use io::{load_settings, save_settings};
pub use paths::{default_config_dir, default_config_path, SETTINGS_FILE};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::remap::RemapOptions;
use crate::resample::ResampleQuality;
use crate::types::{Bitstream, ChannelLayout};

/// Device used when nothing else is configured
pub const DEFAULT_DEVICE: &str = "null:default";

/// Default processing period in milliseconds
pub const DEFAULT_PERIOD_MS: u32 = 20;

/// Accepted processing period range in milliseconds
pub const MIN_PERIOD_MS: u32 = 5;
pub const MAX_PERIOD_MS: u32 = 200;

/// Physical speaker arrangement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeakerLayout {
    #[default]
    #[serde(rename = "stereo")]
    Stereo,
    #[serde(rename = "2.1")]
    Stereo21,
    #[serde(rename = "5.1")]
    Surround51,
    #[serde(rename = "7.1")]
    Surround71,
}

impl SpeakerLayout {
    pub fn layout(&self) -> ChannelLayout {
        match self {
            SpeakerLayout::Stereo => ChannelLayout::stereo(),
            SpeakerLayout::Stereo21 => ChannelLayout::layout_21(),
            SpeakerLayout::Surround51 => ChannelLayout::layout_51(),
            SpeakerLayout::Surround71 => ChannelLayout::layout_71(),
        }
    }
}

/// When UI sound effects are heard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuiSoundMode {
    #[default]
    Always,
    Never,
    /// Only while no stream is playing
    WhenIdle,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// PCM output device, `"<driver>:<device>"`
    pub audio_device: String,
    /// Device for raw bitstreams (empty = same as `audio_device`)
    pub passthrough_device: String,
    pub speakers: SpeakerLayout,
    /// Fixed mix rate; `None` follows the master stream
    pub sample_rate: Option<u32>,
    /// Send compressed bitstreams to the device untouched
    pub passthrough: bool,
    /// Per-codec passthrough switches, consulted when `passthrough` is on
    pub ac3_passthrough: bool,
    pub eac3_passthrough: bool,
    pub dts_passthrough: bool,
    pub dtshd_passthrough: bool,
    pub truehd_passthrough: bool,
    /// Re-encode multichannel PCM into a bitstream the device can carry
    pub transcode: bool,
    /// Spread stereo sources over every speaker
    pub stereo_upmix: bool,
    /// Scale downmix matrices so no output channel can clip
    pub normalize_levels: bool,
    pub gui_sounds: GuiSoundMode,
    /// Processing period in milliseconds
    pub period_ms: u32,
    pub resample_quality: ResampleQuality,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            audio_device: DEFAULT_DEVICE.to_string(),
            passthrough_device: String::new(),
            speakers: SpeakerLayout::Stereo,
            sample_rate: None,
            passthrough: false,
            ac3_passthrough: true,
            eac3_passthrough: false,
            dts_passthrough: true,
            dtshd_passthrough: false,
            truehd_passthrough: false,
            transcode: false,
            stereo_upmix: false,
            normalize_levels: true,
            gui_sounds: GuiSoundMode::Always,
            period_ms: DEFAULT_PERIOD_MS,
            resample_quality: ResampleQuality::default(),
        }
    }
}

impl EngineSettings {
    pub fn remap_options(&self) -> RemapOptions {
        RemapOptions {
            upmix_stereo: self.stereo_upmix,
            normalize: self.normalize_levels,
        }
    }

    /// Device to open for raw bitstream output
    pub fn passthrough_device(&self) -> &str {
        if self.passthrough_device.is_empty() {
            &self.audio_device
        } else {
            &self.passthrough_device
        }
    }

    /// Whether `bitstream` may be passed through untouched
    ///
    /// FLAC is the transcode output and follows `passthrough` alone.
    pub fn passthrough_allowed(&self, bitstream: Bitstream) -> bool {
        self.passthrough
            && match bitstream {
                Bitstream::Ac3 => self.ac3_passthrough,
                Bitstream::Eac3 => self.eac3_passthrough,
                Bitstream::Dts => self.dts_passthrough,
                Bitstream::DtsHd => self.dtshd_passthrough,
                Bitstream::TrueHd => self.truehd_passthrough,
                Bitstream::Flac => true,
            }
    }

    /// Period length, clamped to `MIN_PERIOD_MS..=MAX_PERIOD_MS`
    pub fn period_ms(&self) -> u32 {
        self.period_ms.clamp(MIN_PERIOD_MS, MAX_PERIOD_MS)
    }

    /// Replace out-of-range values with usable ones
    ///
    /// Each correction is logged as a warning naming the setting.
    pub fn validated(mut self) -> Self {
        if self.audio_device.trim().is_empty() {
            log::warn!("{}: empty, using {}", SettingKey::AudioDevice, DEFAULT_DEVICE);
            self.audio_device = DEFAULT_DEVICE.to_string();
        }
        if self.sample_rate == Some(0) {
            log::warn!("{}: 0 Hz, following the master stream", SettingKey::SampleRate);
            self.sample_rate = None;
        }
        let period_ms = self.period_ms();
        if period_ms != self.period_ms {
            log::warn!(
                "{}: {}ms out of range, using {}ms",
                SettingKey::PeriodMs,
                self.period_ms,
                period_ms
            );
            self.period_ms = period_ms;
        }
        self
    }

    /// Keys whose values differ between `self` and `other`
    pub fn changed_keys(&self, other: &EngineSettings) -> Vec<SettingKey> {
        let mut keys = Vec::new();
        let mut check = |changed: bool, key: SettingKey| {
            if changed {
                keys.push(key);
            }
        };
        check(self.audio_device != other.audio_device, SettingKey::AudioDevice);
        check(
            self.passthrough_device != other.passthrough_device,
            SettingKey::PassthroughDevice,
        );
        check(self.speakers != other.speakers, SettingKey::Speakers);
        check(self.sample_rate != other.sample_rate, SettingKey::SampleRate);
        check(self.passthrough != other.passthrough, SettingKey::Passthrough);
        check(self.ac3_passthrough != other.ac3_passthrough, SettingKey::Ac3Passthrough);
        check(self.eac3_passthrough != other.eac3_passthrough, SettingKey::Eac3Passthrough);
        check(self.dts_passthrough != other.dts_passthrough, SettingKey::DtsPassthrough);
        check(self.dtshd_passthrough != other.dtshd_passthrough, SettingKey::DtsHdPassthrough);
        check(
            self.truehd_passthrough != other.truehd_passthrough,
            SettingKey::TrueHdPassthrough,
        );
        check(self.transcode != other.transcode, SettingKey::Transcode);
        check(self.stereo_upmix != other.stereo_upmix, SettingKey::StereoUpmix);
        check(
            self.normalize_levels != other.normalize_levels,
            SettingKey::NormalizeLevels,
        );
        check(self.gui_sounds != other.gui_sounds, SettingKey::GuiSounds);
        check(self.period_ms != other.period_ms, SettingKey::PeriodMs);
        check(
            self.resample_quality != other.resample_quality,
            SettingKey::ResampleQuality,
        );
        keys
    }
}

/// A settings entry whose change the engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    AudioDevice,
    PassthroughDevice,
    Speakers,
    SampleRate,
    Passthrough,
    Ac3Passthrough,
    Eac3Passthrough,
    DtsPassthrough,
    DtsHdPassthrough,
    TrueHdPassthrough,
    Transcode,
    StereoUpmix,
    NormalizeLevels,
    GuiSounds,
    PeriodMs,
    ResampleQuality,
}

impl SettingKey {
    pub const ALL: [SettingKey; 16] = [
        SettingKey::AudioDevice,
        SettingKey::PassthroughDevice,
        SettingKey::Speakers,
        SettingKey::SampleRate,
        SettingKey::Passthrough,
        SettingKey::Ac3Passthrough,
        SettingKey::Eac3Passthrough,
        SettingKey::DtsPassthrough,
        SettingKey::DtsHdPassthrough,
        SettingKey::TrueHdPassthrough,
        SettingKey::Transcode,
        SettingKey::StereoUpmix,
        SettingKey::NormalizeLevels,
        SettingKey::GuiSounds,
        SettingKey::PeriodMs,
        SettingKey::ResampleQuality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::AudioDevice => "audiooutput.audiodevice",
            SettingKey::PassthroughDevice => "audiooutput.passthroughdevice",
            SettingKey::Speakers => "audiooutput.channels",
            SettingKey::SampleRate => "audiooutput.samplerate",
            SettingKey::Passthrough => "audiooutput.passthrough",
            SettingKey::Ac3Passthrough => "audiooutput.ac3passthrough",
            SettingKey::Eac3Passthrough => "audiooutput.eac3passthrough",
            SettingKey::DtsPassthrough => "audiooutput.dtspassthrough",
            SettingKey::DtsHdPassthrough => "audiooutput.dtshdpassthrough",
            SettingKey::TrueHdPassthrough => "audiooutput.truehdpassthrough",
            SettingKey::Transcode => "audiooutput.transcode",
            SettingKey::StereoUpmix => "audiooutput.stereoupmix",
            SettingKey::NormalizeLevels => "audiooutput.normalizelevels",
            SettingKey::GuiSounds => "audiooutput.guisoundmode",
            SettingKey::PeriodMs => "audiooutput.periodms",
            SettingKey::ResampleQuality => "audiooutput.processquality",
        }
    }

    /// Changing this key requires re-opening the sink
    pub fn reopens_sink(&self) -> bool {
        !matches!(
            self,
            SettingKey::StereoUpmix | SettingKey::NormalizeLevels | SettingKey::GuiSounds
        )
    }

    /// Changing this key only rebuilds the channel remappers
    pub fn affects_remap(&self) -> bool {
        matches!(self, SettingKey::StereoUpmix | SettingKey::NormalizeLevels)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown setting name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown setting: {0}")]
pub struct UnknownSetting(pub String);

impl FromStr for SettingKey {
    type Err = UnknownSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| UnknownSetting(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.audio_device, DEFAULT_DEVICE);
        assert_eq!(settings.passthrough_device(), DEFAULT_DEVICE);
        assert_eq!(settings.period_ms(), DEFAULT_PERIOD_MS);
        assert!(settings.remap_options().normalize);
        assert!(!settings.remap_options().upmix_stereo);
    }

    #[test]
    fn test_setting_key_names_roundtrip() {
        for key in SettingKey::ALL {
            assert_eq!(key.as_str().parse::<SettingKey>(), Ok(key));
        }
        assert!("audiooutput.volume".parse::<SettingKey>().is_err());
    }

    #[test]
    fn test_remap_keys_do_not_reopen() {
        assert!(!SettingKey::StereoUpmix.reopens_sink());
        assert!(SettingKey::StereoUpmix.affects_remap());
        assert!(SettingKey::AudioDevice.reopens_sink());
        assert!(!SettingKey::GuiSounds.reopens_sink());
        assert!(!SettingKey::GuiSounds.affects_remap());
    }

    #[test]
    fn test_speaker_layout_yaml_names() {
        let yaml = serde_yaml::to_string(&SpeakerLayout::Surround51).unwrap();
        assert!(yaml.contains("5.1"));
        assert_eq!(
            serde_yaml::from_str::<SpeakerLayout>(&yaml).unwrap(),
            SpeakerLayout::Surround51
        );
        let parsed: SpeakerLayout = serde_yaml::from_str("\"7.1\"").unwrap();
        assert_eq!(parsed.layout().count(), 8);
    }

    #[test]
    fn test_changed_keys() {
        let old = EngineSettings::default();
        let mut new = old.clone();
        assert!(old.changed_keys(&new).is_empty());

        new.stereo_upmix = true;
        new.audio_device = "wav:/tmp/x.wav".to_string();
        assert_eq!(
            old.changed_keys(&new),
            vec![SettingKey::AudioDevice, SettingKey::StereoUpmix]
        );
    }

    #[test]
    fn test_per_codec_passthrough() {
        let mut settings = EngineSettings::default();
        assert!(!settings.passthrough_allowed(Bitstream::Ac3));

        settings.passthrough = true;
        assert!(settings.passthrough_allowed(Bitstream::Ac3));
        assert!(settings.passthrough_allowed(Bitstream::Dts));
        assert!(!settings.passthrough_allowed(Bitstream::Eac3));
        assert!(!settings.passthrough_allowed(Bitstream::TrueHd));
        assert!(!settings.passthrough_allowed(Bitstream::DtsHd));
        assert!(settings.passthrough_allowed(Bitstream::Flac));

        settings.truehd_passthrough = true;
        assert!(settings.passthrough_allowed(Bitstream::TrueHd));
        assert_eq!(
            EngineSettings::default().changed_keys(&settings),
            vec![SettingKey::Passthrough, SettingKey::TrueHdPassthrough]
        );
        assert!(SettingKey::TrueHdPassthrough.reopens_sink());
    }

    #[test]
    fn test_validated_repairs_bad_values() {
        let settings = EngineSettings {
            audio_device: "  ".to_string(),
            sample_rate: Some(0),
            period_ms: 1000,
            ..EngineSettings::default()
        }
        .validated();
        assert_eq!(settings.audio_device, DEFAULT_DEVICE);
        assert_eq!(settings.sample_rate, None);
        assert_eq!(settings.period_ms, MAX_PERIOD_MS);

        let tiny = EngineSettings { period_ms: 0, ..EngineSettings::default() };
        assert_eq!(tiny.validated().period_ms, MIN_PERIOD_MS);
    }

    #[test]
    fn test_validated_keeps_good_values() {
        let settings = EngineSettings {
            audio_device: "wav:/tmp/x.wav".to_string(),
            sample_rate: Some(48000),
            period_ms: 40,
            ..EngineSettings::default()
        };
        assert_eq!(settings.clone().validated(), settings);
    }

    #[test]
    fn test_gui_sound_mode_yaml_names() {
        let parsed: GuiSoundMode = serde_yaml::from_str("when_idle").unwrap();
        assert_eq!(parsed, GuiSoundMode::WhenIdle);
    }
}
