//! Channel remapping
//!
//! Builds a gain matrix from an input [`ChannelLayout`] to an output layout
//! and applies it to interleaved `f32` frames. Roles present on both sides map
//! straight through; missing roles are folded into their nearest neighbours
//! (center into the front pair, backs into sides, and so on). LFE is dropped
//! when the output has no LFE channel.

use crate::types::{Channel, ChannelLayout};

/// -3 dB
const MINUS_3DB: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Options affecting matrix construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapOptions {
    /// Spread a plain stereo source over surround outputs
    pub upmix_stereo: bool,
    /// Scale the matrix down so no output can exceed full scale
    pub normalize: bool,
}

impl Default for RemapOptions {
    fn default() -> Self {
        Self {
            upmix_stereo: false,
            normalize: true,
        }
    }
}

/// Fallback routes for a role missing from the output, in preference order
///
/// A route is taken only if every role it names exists in the output.
fn fallback_routes(channel: Channel) -> &'static [&'static [(Channel, f32)]] {
    use Channel::*;
    match channel {
        FC => &[&[(FL, MINUS_3DB), (FR, MINUS_3DB)]],
        FL => &[&[(FC, MINUS_3DB)]],
        FR => &[&[(FC, MINUS_3DB)]],
        LFE => &[],
        BL => &[&[(SL, 1.0)], &[(FL, MINUS_3DB)], &[(FC, MINUS_3DB)]],
        BR => &[&[(SR, 1.0)], &[(FR, MINUS_3DB)], &[(FC, MINUS_3DB)]],
        SL => &[&[(BL, 1.0)], &[(FL, MINUS_3DB)], &[(FC, MINUS_3DB)]],
        SR => &[&[(BR, 1.0)], &[(FR, MINUS_3DB)], &[(FC, MINUS_3DB)]],
        BC | TBC => &[
            &[(BL, MINUS_3DB), (BR, MINUS_3DB)],
            &[(SL, MINUS_3DB), (SR, MINUS_3DB)],
            &[(FL, 0.5), (FR, 0.5)],
            &[(FC, MINUS_3DB)],
        ],
        FLOC => &[&[(FL, 1.0)], &[(FC, MINUS_3DB)]],
        FROC => &[&[(FR, 1.0)], &[(FC, MINUS_3DB)]],
        TFL => &[&[(FL, 1.0)], &[(FC, MINUS_3DB)]],
        TFR => &[&[(FR, 1.0)], &[(FC, MINUS_3DB)]],
        TFC => &[&[(FC, 1.0)], &[(FL, MINUS_3DB), (FR, MINUS_3DB)]],
        TC => &[&[(FC, MINUS_3DB)], &[(FL, 0.5), (FR, 0.5)]],
        TBL => &[&[(BL, 1.0)], &[(SL, 1.0)], &[(FL, MINUS_3DB)]],
        TBR => &[&[(BR, 1.0)], &[(SR, 1.0)], &[(FR, MINUS_3DB)]],
    }
}

/// Interleaved channel remapper
#[derive(Debug, Clone)]
pub struct Remapper {
    /// Row-major `[out][in]` gain matrix
    matrix: Vec<f32>,
    in_channels: usize,
    out_channels: usize,
    identity: bool,
}

impl Remapper {
    pub fn new(input: &ChannelLayout, output: &ChannelLayout, options: RemapOptions) -> Self {
        let in_channels = input.count();
        let out_channels = output.count();
        let mut matrix = vec![0.0f32; in_channels * out_channels];

        for (i, channel) in input.iter().enumerate() {
            if let Some(o) = output.position(channel) {
                matrix[o * in_channels + i] += 1.0;
                continue;
            }

            let route = fallback_routes(channel)
                .iter()
                .find(|route| route.iter().all(|(target, _)| output.contains(*target)));

            match route {
                Some(route) => {
                    for (target, gain) in route.iter() {
                        if let Some(o) = output.position(*target) {
                            matrix[o * in_channels + i] += gain;
                        }
                    }
                }
                None => {
                    log::debug!("Remap: dropping {} (no route into {})", channel.name(), output);
                }
            }
        }

        if options.upmix_stereo && *input == ChannelLayout::stereo() && out_channels > 2 {
            Self::apply_stereo_upmix(&mut matrix, in_channels, output);
        }

        if options.normalize {
            let max_row_sum = (0..out_channels)
                .map(|o| matrix[o * in_channels..(o + 1) * in_channels].iter().sum::<f32>())
                .fold(0.0f32, f32::max);
            if max_row_sum > 1.0 {
                for gain in matrix.iter_mut() {
                    *gain /= max_row_sum;
                }
            }
        }

        let identity = input == output;

        Self {
            matrix,
            in_channels,
            out_channels,
            identity,
        }
    }

    /// Feed the front pair into the center and surround channels as well
    fn apply_stereo_upmix(matrix: &mut [f32], in_channels: usize, output: &ChannelLayout) {
        use Channel::*;
        let surround_left = output.position(BL).or_else(|| output.position(SL));
        let surround_right = output.position(BR).or_else(|| output.position(SR));

        if let (Some(l), Some(r)) = (surround_left, surround_right) {
            matrix[l * in_channels] += 1.0;
            matrix[r * in_channels + 1] += 1.0;
        }
        if let Some(c) = output.position(FC) {
            matrix[c * in_channels] += 0.5;
            matrix[c * in_channels + 1] += 0.5;
        }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Gain applied from input channel `input` to output channel `output`
    pub fn gain(&self, output: usize, input: usize) -> f32 {
        self.matrix[output * self.in_channels + input]
    }

    /// Remap whole frames of `src`, appending to `dst`
    pub fn process(&self, src: &[f32], dst: &mut Vec<f32>) {
        if self.identity {
            dst.extend_from_slice(src);
            return;
        }

        let frames = src.len() / self.in_channels.max(1);
        dst.reserve(frames * self.out_channels);
        for frame in src.chunks_exact(self.in_channels) {
            for row in self.matrix.chunks_exact(self.in_channels) {
                let sample: f32 = row.iter().zip(frame).map(|(g, s)| g * s).sum();
                dst.push(sample);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_layout_is_identity() {
        let remap = Remapper::new(
            &ChannelLayout::stereo(),
            &ChannelLayout::stereo(),
            RemapOptions::default(),
        );
        assert!(remap.is_identity());
        let mut out = Vec::new();
        remap.process(&[0.25, -0.5], &mut out);
        assert_eq!(out, vec![0.25, -0.5]);
    }

    #[test]
    fn test_51_downmix_to_stereo() {
        let remap = Remapper::new(
            &ChannelLayout::layout_51(),
            &ChannelLayout::stereo(),
            RemapOptions {
                upmix_stereo: false,
                normalize: false,
            },
        );
        // FL FR FC LFE BL BR
        assert_eq!(remap.gain(0, 0), 1.0);
        assert!((remap.gain(0, 2) - MINUS_3DB).abs() < 1e-6);
        assert_eq!(remap.gain(0, 3), 0.0);
        assert!((remap.gain(1, 5) - MINUS_3DB).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_keeps_full_scale() {
        let remap = Remapper::new(
            &ChannelLayout::layout_51(),
            &ChannelLayout::stereo(),
            RemapOptions::default(),
        );
        let mut out = Vec::new();
        remap.process(&[1.0; 6], &mut out);
        assert!(out.iter().all(|s| *s <= 1.0 + 1e-6));
    }

    #[test]
    fn test_mono_reaches_both_fronts() {
        let remap = Remapper::new(
            &ChannelLayout::mono(),
            &ChannelLayout::stereo(),
            RemapOptions::default(),
        );
        let mut out = Vec::new();
        remap.process(&[1.0, 0.5], &mut out);
        assert_eq!(out.len(), 4);
        assert!((out[0] - out[1]).abs() < 1e-6);
        assert!(out[0] > 0.5);
    }

    #[test]
    fn test_stereo_upmix_feeds_surrounds() {
        let remap = Remapper::new(
            &ChannelLayout::stereo(),
            &ChannelLayout::layout_51(),
            RemapOptions {
                upmix_stereo: true,
                normalize: false,
            },
        );
        let mut out = Vec::new();
        remap.process(&[1.0, 0.0], &mut out);
        // FL FR FC LFE BL BR
        assert_eq!(out, vec![1.0, 0.0, 0.5, 0.0, 1.0, 0.0]);
    }
}
