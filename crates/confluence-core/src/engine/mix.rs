//! Per-cycle mixing helpers for the output thread

use basedrop::Shared;

use crate::stream::Stream;

/// Accumulate one frame from every playing PCM stream into `mix`
///
/// Raw-bitstream streams are pulled and discarded so their producers keep
/// moving. Paused streams are skipped. Returns true if any stream
/// contributed a frame.
pub(crate) fn mix_streams(streams: &[Shared<Stream>], mix: &mut [f32], channels: usize) -> bool {
    let mut mixed = false;
    for stream in streams {
        if stream.format().is_raw() {
            stream.get_frame();
            continue;
        }
        if stream.is_paused() {
            continue;
        }
        mixed |= stream.mix_into(mix, channels);
    }
    mixed
}

/// Apply master gain and hard-limit to full scale
pub(crate) fn apply_master(mix: &mut [f32], gain: f32) {
    if gain != 1.0 {
        for s in mix.iter_mut() {
            *s *= gain;
        }
    }
    for s in mix.iter_mut() {
        if s.abs() > 1.0 {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

/// Interleaved stereo view of `mix` for the visualization tap
///
/// Mono is duplicated; wider layouts contribute their first two channels
/// (front left/right).
pub(crate) fn stereo_tap(mix: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    match channels {
        0 => {}
        1 => {
            for s in mix {
                out.push(*s);
                out.push(*s);
            }
        }
        _ => {
            for frame in mix.chunks_exact(channels) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
        }
    }
}
