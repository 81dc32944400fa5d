//! Confluence command line player
//!
//! ## Usage
//!
//! ```text
//! confluence [--config <file>] [--device <driver:device>] <command>
//!
//!   devices [--passthrough]     list output devices
//!   play <file.wav> [--volume <0..1>] [--fade <ms>]
//!   sound <file.wav>            fire a UI sound and wait for it
//! ```
//!
//! Settings come from `audio.yaml` in the user config directory unless
//! `--config` points elsewhere. Set RUST_LOG=debug for verbose output.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use confluence_core::config::{default_config_path, load_settings, EngineSettings};
use confluence_core::sink::SinkRegistry;
use confluence_core::sound::read_wav;
use confluence_core::stream::StreamOptions;
use confluence_core::{Engine, SampleFormat};

/// Frames offered per `add_data` call
const CHUNK_FRAMES: usize = 4096;

/// Back-off while the stream is full
const FEED_WAIT: Duration = Duration::from_millis(10);

/// Give up waiting for playout after this long
const PLAYOUT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "confluence")]
#[command(about = "Play audio through the Confluence mixing engine", long_about = None)]
struct Args {
    /// Settings file (default: audio.yaml in the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Output device as `<driver>:<device>`, overriding the settings file
    #[arg(long, global = true)]
    device: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List output devices
    Devices {
        /// List devices that accept compressed bitstreams
        #[arg(long)]
        passthrough: bool,
    },
    /// Play a WAV file
    Play {
        path: PathBuf,
        /// Stream volume, 0..1
        #[arg(long, default_value_t = 1.0, value_parser = parse_volume)]
        volume: f32,
        /// Fade-in length in milliseconds
        #[arg(long = "fade", default_value_t = 0)]
        fade_ms: u32,
    },
    /// Fire a UI sound and wait for it
    Sound { path: PathBuf },
}

fn parse_volume(value: &str) -> std::result::Result<f32, String> {
    let volume: f32 = value.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=1.0).contains(&volume) {
        Ok(volume)
    } else {
        Err(format!("{} is outside 0..1", volume))
    }
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut settings = load_settings(&config_path);
    if let Some(device) = args.device {
        settings.audio_device = device;
    }

    match args.command {
        Command::Devices { passthrough } => list_devices(passthrough),
        Command::Play { path, volume, fade_ms } => play(settings, &path, volume, fade_ms),
        Command::Sound { path } => sound(settings, &path),
    }
}

fn list_devices(passthrough: bool) -> Result<()> {
    let registry = SinkRegistry::with_defaults();
    let default = registry.default_device(passthrough);
    for (label, device) in registry.enumerate_output_devices(passthrough) {
        let marker = if default.as_deref() == Some(device.as_str()) { "*" } else { " " };
        println!("{} {:<32} {}", marker, device, label);
    }
    Ok(())
}

fn play(settings: EngineSettings, path: &Path, volume: f32, fade_ms: u32) -> Result<()> {
    let clip = read_wav(path).with_context(|| format!("Failed to read {:?}", path))?;
    log::info!(
        "Playing {:?}: {} ({:.1}s)",
        path,
        clip.format,
        clip.duration_seconds()
    );

    let engine = Engine::start(settings, SinkRegistry::with_defaults())
        .context("Failed to start the audio engine")?;
    println!(
        "Output: {} via {}",
        engine.output_device().unwrap_or_else(|| "none".into()),
        engine.mode()
    );

    let stream = engine
        .make_stream(
            SampleFormat::Float,
            clip.format.sample_rate,
            None,
            clip.format.layout.clone(),
            StreamOptions::default(),
        )
        .context("Failed to create stream")?;

    if fade_ms > 0 {
        stream.fade_volume(0.0, volume, fade_ms);
    } else {
        stream.set_volume(volume);
    }

    let bytes: Vec<u8> = clip.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let chunk = CHUNK_FRAMES * stream.format().frame_size();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + chunk).min(bytes.len());
        let taken = stream.add_data(&bytes[offset..end]);
        if taken == 0 {
            thread::sleep(FEED_WAIT);
        }
        offset += taken;
    }

    stream.drain();
    let started = Instant::now();
    while !stream.is_drained() {
        if started.elapsed() > PLAYOUT_TIMEOUT {
            log::warn!("Playout did not finish within {:?}", PLAYOUT_TIMEOUT);
            break;
        }
        thread::sleep(FEED_WAIT);
    }

    let underruns = stream.underruns();
    if underruns > 0 {
        log::warn!("{} underruns during playback", underruns);
    }
    stream.destroy();
    Ok(())
}

fn sound(settings: EngineSettings, path: &Path) -> Result<()> {
    let engine = Engine::start(settings, SinkRegistry::with_defaults())
        .context("Failed to start the audio engine")?;
    let effect = engine
        .make_sound(path)
        .with_context(|| format!("Failed to load {:?}", path))?;

    if !effect.play() {
        bail!("Sound {:?} could not be played", path);
    }

    let deadline = Instant::now() + Duration::from_secs_f64(effect.duration_seconds() + 1.0);
    while effect.is_playing() && Instant::now() < deadline {
        thread::sleep(FEED_WAIT);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(list: &[&str]) -> std::result::Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("confluence").chain(list.iter().copied()))
    }

    #[test]
    fn test_parse_play_with_flags() {
        let parsed = parse(&["--device", "wav:/tmp/out.wav", "play", "a.wav", "--volume", "0.5"]).unwrap();
        assert_eq!(parsed.device.as_deref(), Some("wav:/tmp/out.wav"));
        match parsed.command {
            Command::Play { path, volume, fade_ms } => {
                assert_eq!(path, PathBuf::from("a.wav"));
                assert_eq!(volume, 0.5);
                assert_eq!(fade_ms, 0);
            }
            _ => panic!("expected play"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_command() {
        let parsed = parse(&["play", "a.wav", "--fade", "250", "--config", "/tmp/audio.yaml"]).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("/tmp/audio.yaml")));
        assert!(matches!(parsed.command, Command::Play { fade_ms: 250, .. }));
    }

    #[test]
    fn test_parse_devices_passthrough() {
        let parsed = parse(&["devices", "--passthrough"]).unwrap();
        assert!(matches!(parsed.command, Command::Devices { passthrough: true }));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse(&["play"]).is_err());
        assert!(parse(&["--bogus", "devices"]).is_err());
        assert!(parse(&[]).is_err());
        assert!(parse(&["play", "a.wav", "--volume", "2"]).is_err());
        assert!(parse(&["play", "a.wav", "--volume", "loud"]).is_err());
    }

    #[test]
    fn test_args_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
