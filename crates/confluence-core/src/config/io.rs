//! Settings file I/O
//!
//! `EngineSettings` is stored as YAML. Loading never fails: a missing or
//! broken file falls back to the defaults, and whatever is loaded goes
//! through [`EngineSettings::validated`] before the engine sees it.

use anyhow::{Context, Result};
use std::path::Path;

use super::EngineSettings;

/// Load engine settings from a YAML file
///
/// A missing file yields the defaults. A file that cannot be read or parsed
/// logs a warning and also yields the defaults.
pub fn load_settings(path: &Path) -> EngineSettings {
    log::info!("load_settings: Loading from {:?}", path);

    let settings = if path.exists() {
        match read_settings(path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("load_settings: {:#}, using defaults", e);
                EngineSettings::default()
            }
        }
    } else {
        log::info!("load_settings: Settings file doesn't exist, using defaults");
        EngineSettings::default()
    };

    let settings = settings.validated();
    log::info!(
        "load_settings: device={} speakers={:?} passthrough={} transcode={}",
        settings.audio_device,
        settings.speakers,
        settings.passthrough,
        settings.transcode
    );
    settings
}

fn read_settings(path: &Path) -> Result<EngineSettings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;
    serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse settings: {:?}", path))
}

/// Save engine settings to a YAML file, creating parent directories
///
/// The settings are validated first, and the file is replaced atomically so
/// a reader never sees a half-written file.
pub fn save_settings(settings: &EngineSettings, path: &Path) -> Result<()> {
    log::info!("save_settings: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let settings = settings.clone().validated();
    let yaml = serde_yaml::to_string(&settings).context("Failed to serialize settings to YAML")?;

    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).with_context(|| format!("Failed to write settings file: {:?}", tmp))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace settings file: {:?}", path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuiSoundMode, SpeakerLayout, DEFAULT_DEVICE, MAX_PERIOD_MS};

    #[test]
    fn test_load_nonexistent_returns_default() {
        let settings = load_settings(Path::new("/nonexistent/path/audio.yaml"));
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn test_settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audio.yaml");

        let settings = EngineSettings {
            audio_device: "wav:/tmp/out.wav".to_string(),
            speakers: SpeakerLayout::Surround51,
            sample_rate: Some(48000),
            transcode: true,
            gui_sounds: GuiSoundMode::WhenIdle,
            ..EngineSettings::default()
        };

        save_settings(&settings, &path).unwrap();
        assert!(!path.with_extension("yaml.tmp").exists());
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.yaml");
        std::fs::write(&path, "passthrough: true\nperiod_ms: 40\n").unwrap();

        let loaded = load_settings(&path);
        assert!(loaded.passthrough);
        assert_eq!(loaded.period_ms, 40);
        assert_eq!(loaded.audio_device, DEFAULT_DEVICE);
    }

    #[test]
    fn test_invalid_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.yaml");
        std::fs::write(&path, "speakers: [this is: not valid").unwrap();

        assert_eq!(load_settings(&path), EngineSettings::default());
    }

    #[test]
    fn test_loaded_values_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.yaml");
        std::fs::write(&path, "audio_device: \"\"\nsample_rate: 0\nperiod_ms: 5000\n").unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.audio_device, DEFAULT_DEVICE);
        assert_eq!(loaded.sample_rate, None);
        assert_eq!(loaded.period_ms, MAX_PERIOD_MS);
    }

    #[test]
    fn test_save_writes_validated_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.yaml");
        let settings = EngineSettings { period_ms: 0, ..EngineSettings::default() };

        save_settings(&settings, &path).unwrap();
        let written: EngineSettings =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.period_ms, crate::config::MIN_PERIOD_MS);
    }
}
