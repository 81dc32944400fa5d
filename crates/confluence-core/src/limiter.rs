//! Peak limiter for amplified streams
//!
//! A stream amplified above unity would clip on loud passages. The limiter
//! follows the peak of each incoming frame (instant attack, exponential
//! release) and returns the largest gain up to the requested amplification
//! that keeps the frame at or below full scale.

/// Release time of the peak envelope
const RELEASE_MS: f32 = 50.0;

/// Largest amplification a stream accepts (about +30 dB)
pub const MAX_AMPLIFICATION: f32 = 32.0;

#[derive(Debug, Clone)]
pub struct Limiter {
    release_coeff: f32,
    envelope: f32,
}

impl Limiter {
    pub fn new(sample_rate: u32) -> Self {
        let mut limiter = Self {
            release_coeff: 0.0,
            envelope: 0.0,
        };
        limiter.set_sample_rate(sample_rate);
        limiter
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        let release_frames = (RELEASE_MS / 1000.0) * sample_rate.max(1) as f32;
        self.release_coeff = (-1.0 / release_frames).exp();
    }

    /// Gain to apply to `frame` so that `frame * gain` stays within [-1, 1],
    /// never more than `amplification`
    pub fn run(&mut self, frame: &[f32], amplification: f32) -> f32 {
        let peak = frame.iter().fold(0.0f32, |m, s| m.max(s.abs())) * amplification;

        if peak > self.envelope {
            self.envelope = peak;
        } else {
            self.envelope = peak + self.release_coeff * (self.envelope - peak);
        }

        if self.envelope > 1.0 {
            amplification / self.envelope
        } else {
            amplification
        }
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(crate::types::DEFAULT_SAMPLE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_frames_get_full_amplification() {
        let mut limiter = Limiter::new(48000);
        assert_eq!(limiter.run(&[0.1, -0.1], 4.0), 4.0);
    }

    #[test]
    fn test_loud_frame_is_held_at_full_scale() {
        let mut limiter = Limiter::new(48000);
        let frame = [0.5, -0.8];
        let gain = limiter.run(&frame, 4.0);
        assert!(frame.iter().all(|s| (s * gain).abs() <= 1.0 + 1e-6));
        assert!((0.8 * gain - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_gain_recovers_after_release() {
        let mut limiter = Limiter::new(48000);
        let loud = limiter.run(&[1.0, 1.0], 2.0);
        assert!((loud - 1.0).abs() < 1e-6);

        // Just after the peak the envelope still holds the gain down
        let next = limiter.run(&[0.1, 0.1], 2.0);
        assert!(next < 2.0);

        // A second of quiet frames releases it completely
        let mut gain = next;
        for _ in 0..48000 {
            gain = limiter.run(&[0.1, 0.1], 2.0);
        }
        assert_eq!(gain, 2.0);

        limiter.run(&[1.0], 2.0);
        limiter.reset();
        assert_eq!(limiter.run(&[0.1], 2.0), 2.0);
    }
}
