//! Sample format conversion
//!
//! Pure functions between byte encodings and the `f32` working format. Raw
//! bitstream formats are rejected: they are routed, never decoded.

use thiserror::Error;

use crate::types::SampleFormat;

const SCALE_8: f32 = 1.0 / 128.0;
const SCALE_16: f32 = 1.0 / 32768.0;
const SCALE_24: f32 = 1.0 / 8_388_608.0;
const SCALE_32: f64 = 1.0 / 2_147_483_648.0;

/// Conversion errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("Raw bitstream {0} cannot be converted to PCM")]
    RawFormat(SampleFormat),
}

/// Decode `src` into `dst` as `f32` samples, appending
///
/// Trailing bytes that do not make up a whole sample are ignored. Returns
/// the number of samples appended.
pub fn to_float(src: &[u8], format: SampleFormat, dst: &mut Vec<f32>) -> Result<usize, ConvertError> {
    let before = dst.len();
    match format {
        SampleFormat::U8 => {
            dst.extend(src.iter().map(|&b| (b as f32 - 128.0) * SCALE_8));
        }
        SampleFormat::S16LE => {
            dst.extend(
                src.chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 * SCALE_16),
            );
        }
        SampleFormat::S16BE => {
            dst.extend(
                src.chunks_exact(2)
                    .map(|b| i16::from_be_bytes([b[0], b[1]]) as f32 * SCALE_16),
            );
        }
        SampleFormat::S24LE3 => {
            dst.extend(src.chunks_exact(3).map(|b| {
                // Shift into the top of an i32 to sign-extend
                let v = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                v as f32 * SCALE_24
            }));
        }
        SampleFormat::S24LE4 => {
            dst.extend(src.chunks_exact(4).map(|b| {
                let v = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                v as f32 * SCALE_24
            }));
        }
        SampleFormat::S32LE => {
            dst.extend(src.chunks_exact(4).map(|b| {
                (i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 * SCALE_32) as f32
            }));
        }
        SampleFormat::Float => {
            dst.extend(
                src.chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
        }
        SampleFormat::Double => {
            dst.extend(src.chunks_exact(8).map(|b| {
                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
            }));
        }
        SampleFormat::Raw(_) => return Err(ConvertError::RawFormat(format)),
    }
    Ok(dst.len() - before)
}

/// Encode `f32` samples into `dst` in `format`, appending
///
/// Integer targets are clamped to full scale before quantization.
pub fn from_float(src: &[f32], format: SampleFormat, dst: &mut Vec<u8>) -> Result<(), ConvertError> {
    dst.reserve(src.len() * format.bytes_per_sample());
    match format {
        SampleFormat::U8 => {
            dst.extend(src.iter().map(|&s| (s.clamp(-1.0, 1.0) * 127.0 + 128.0).round() as u8));
        }
        SampleFormat::S16LE => {
            for &s in src {
                dst.extend_from_slice(&quantize(s, 16).to_le_bytes()[..2]);
            }
        }
        SampleFormat::S16BE => {
            for &s in src {
                dst.extend_from_slice(&(quantize(s, 16) as i16).to_be_bytes());
            }
        }
        SampleFormat::S24LE3 => {
            for &s in src {
                dst.extend_from_slice(&quantize(s, 24).to_le_bytes()[..3]);
            }
        }
        SampleFormat::S24LE4 => {
            for &s in src {
                dst.extend_from_slice(&quantize(s, 24).to_le_bytes());
            }
        }
        SampleFormat::S32LE => {
            for &s in src {
                dst.extend_from_slice(&quantize(s, 32).to_le_bytes());
            }
        }
        SampleFormat::Float => {
            #[cfg(target_endian = "little")]
            dst.extend_from_slice(bytemuck::cast_slice::<f32, u8>(src));
            #[cfg(not(target_endian = "little"))]
            for &s in src {
                dst.extend_from_slice(&s.to_le_bytes());
            }
        }
        SampleFormat::Double => {
            for &s in src {
                dst.extend_from_slice(&(s as f64).to_le_bytes());
            }
        }
        SampleFormat::Raw(_) => return Err(ConvertError::RawFormat(format)),
    }
    Ok(())
}

/// Quantize a float sample to a signed integer of `bits` resolution
///
/// The result is left in the low bits of the `i32` (sign-extended).
pub fn quantize(sample: f32, bits: u32) -> i32 {
    let max = ((1i64 << (bits - 1)) - 1) as f64;
    (sample.clamp(-1.0, 1.0) as f64 * max).round() as i32
}
