//! Producer-side stream handle

use std::fmt;
use std::sync::Arc;

use super::state::EngineShared;
use crate::stream::{Stream, StreamId};
use crate::types::AudioFormat;

/// A producer's handle to a stream owned by the engine
///
/// Every call looks the stream up by id, so a handle whose stream has been
/// reaped degrades to no-ops (zero bytes accepted, zero space). Dropping the
/// handle destroys the stream: buffered audio still plays out, then the
/// output thread reaps it.
pub struct StreamHandle {
    id: StreamId,
    format: AudioFormat,
    shared: Arc<EngineShared>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("format", &self.format)
            .finish()
    }
}

impl StreamHandle {
    pub(crate) fn new(id: StreamId, format: AudioFormat, shared: Arc<EngineShared>) -> Self {
        Self { id, format, shared }
    }

    fn with<R>(&self, f: impl FnOnce(&Stream) -> R) -> Option<R> {
        let stream = self.shared.lock_streams().get(self.id)?;
        Some(f(&stream))
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Input format this stream was created with
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Offer bytes; returns how many were taken (whole frames, never blocks)
    pub fn add_data(&self, data: &[u8]) -> usize {
        let accepted = self.with(|s| s.add_data(data)).unwrap_or(0);
        if accepted > 0 {
            self.shared.wake();
        }
        accepted
    }

    pub fn space(&self) -> usize {
        self.with(|s| s.space()).unwrap_or(0)
    }

    pub fn pause(&self) {
        self.with(|s| s.pause());
    }

    pub fn resume(&self) {
        self.with(|s| s.resume());
        self.shared.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.with(|s| s.is_paused()).unwrap_or(false)
    }

    pub fn drain(&self) {
        self.with(|s| s.drain());
        self.shared.wake();
    }

    pub fn is_draining(&self) -> bool {
        self.with(|s| s.is_draining()).unwrap_or(false)
    }

    /// True once drained, or once the stream is gone
    pub fn is_drained(&self) -> bool {
        self.with(|s| s.is_drained()).unwrap_or(true)
    }

    pub fn flush(&self) {
        self.with(|s| s.flush());
    }

    pub fn set_volume(&self, volume: f32) {
        self.with(|s| s.set_volume(volume));
    }

    pub fn volume(&self) -> f32 {
        self.with(|s| s.volume()).unwrap_or(0.0)
    }

    pub fn set_replay_gain(&self, gain: f32) {
        self.with(|s| s.set_replay_gain(gain));
    }

    pub fn replay_gain(&self) -> f32 {
        self.with(|s| s.replay_gain()).unwrap_or(1.0)
    }

    /// Boost above unity through the stream's limiter
    pub fn set_amplification(&self, amplification: f32) {
        self.with(|s| s.set_amplification(amplification));
    }

    pub fn amplification(&self) -> f32 {
        self.with(|s| s.amplification()).unwrap_or(1.0)
    }

    pub fn fade_volume(&self, from: f32, to: f32, duration_ms: u32) {
        self.with(|s| s.fade_volume(from, to, duration_ms));
    }

    pub fn is_fading(&self) -> bool {
        self.with(|s| s.is_fading()).unwrap_or(false)
    }

    /// Seconds until data added now is heard (stream buffering + output)
    pub fn delay(&self) -> f64 {
        let stream = self.with(|s| s.delay()).unwrap_or(0.0);
        stream + self.shared.output_delay()
    }

    pub fn cache_time(&self) -> f64 {
        self.with(|s| s.cache_time()).unwrap_or(0.0)
    }

    pub fn cache_total(&self) -> f64 {
        self.with(|s| s.cache_total()).unwrap_or(0.0)
    }

    pub fn set_resample_ratio(&self, ratio: f64) -> bool {
        self.with(|s| s.set_resample_ratio(ratio)).unwrap_or(false)
    }

    pub fn resample_ratio(&self) -> f64 {
        self.with(|s| s.resample_ratio()).unwrap_or(1.0)
    }

    pub fn underruns(&self) -> usize {
        self.with(|s| s.underruns()).unwrap_or(0)
    }

    /// Destroy the stream (same as dropping the handle)
    pub fn destroy(self) {}
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.with(|s| s.destroy()).is_some() {
            log::debug!("{}: destroyed by producer", self.id);
        }
        self.shared.wake();
    }
}
