//! Standard locations for the settings file

use std::path::PathBuf;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "audio.yaml";

/// Per-user configuration directory
///
/// Returns: `<config dir>/confluence` (e.g. `~/.config/confluence`)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("confluence")
}

/// Default settings file path: `<config dir>/confluence/audio.yaml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(SETTINGS_FILE)
}
