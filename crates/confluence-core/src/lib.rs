//! Confluence Core - software audio mixing engine
//!
//! Producers push PCM or compressed bitstreams into streams; one output
//! thread per engine mixes them with sound effects and feeds a pluggable
//! sink, in one of three modes: float mix, raw passthrough, or transcode
//! to a bitstream.

pub mod buffer;
pub mod config;
pub mod convert;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod remap;
pub mod resample;
pub mod sink;
pub mod sound;
pub mod stream;
pub mod types;

pub use engine::{Engine, OutputMode, StreamHandle};
pub use error::{EngineError, EngineResult};
pub use types::*;
