//! Quantization and 4-bit packing engine.
//!
//! Pure, stateless functions over raw byte buffers plus a
//! [`QuantizationConfig`]. Codes live in the unsigned byte range `[0, 255]`;
//! 4-bit codes occupy `[0, 15]` and are packed two per byte, low nibble
//! first. Symmetric configurations fix the zero point at the midpoint 128.

use crate::arith::Arithmetic;
use crate::{Result, TensorError};
use num_traits::Float;
#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

/// Zero point used whenever a configuration is symmetric.
pub const SYMMETRIC_ZERO_POINT: i32 = 128;

/// Scale, zero point and symmetry flag for one quantized buffer.
///
/// `real_value = scale * (code - zero_point)`. The stored zero point is
/// ignored in symmetric mode, where it is fixed at 128.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct QuantizationConfig {
    pub scale: f32,
    pub zero_point: i32,
    pub symmetric: bool,
}

impl QuantizationConfig {
    /// Validates that `scale` is strictly positive; the zero point is
    /// validated only in asymmetric mode (it is ignored otherwise).
    pub fn new(scale: f32, zero_point: i32, symmetric: bool) -> Result<Self> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(TensorError::invalid_argument(
                "QuantizationConfig",
                format!("scale must be strictly positive, got {scale}"),
            ));
        }
        if !symmetric && !(0..=255).contains(&zero_point) {
            return Err(TensorError::invalid_argument(
                "QuantizationConfig",
                format!("zero point must be in [0, 255], got {zero_point}"),
            ));
        }
        Ok(Self {
            scale,
            zero_point,
            symmetric,
        })
    }

    pub fn symmetric(scale: f32) -> Result<Self> {
        Self::new(scale, SYMMETRIC_ZERO_POINT, true)
    }

    pub fn asymmetric(scale: f32, zero_point: i32) -> Result<Self> {
        Self::new(scale, zero_point, false)
    }

    /// Derive scale and zero point so the observed value range maps onto the
    /// representable code range. Symmetric mode maps `[-|max|, |max|]` onto
    /// `[1, 255]` centered at 128; asymmetric maps `[min, max]` onto
    /// `[0, 255]`.
    pub fn from_range(min: f32, max: f32, symmetric: bool) -> Result<Self> {
        if symmetric {
            let abs_max = min.abs().max(max.abs());
            if abs_max == 0.0 {
                return Err(TensorError::invalid_argument(
                    "QuantizationConfig::from_range",
                    "degenerate range: |max| is zero",
                ));
            }
            Self::symmetric(abs_max / 127.0)
        } else {
            if max <= min {
                return Err(TensorError::invalid_argument(
                    "QuantizationConfig::from_range",
                    format!("degenerate range: min {min} is not below max {max}"),
                ));
            }
            let scale = (max - min) / 255.0;
            let zero_point = (-min / scale).round().clamp(0.0, 255.0) as i32;
            Self::asymmetric(scale, zero_point)
        }
    }

    /// Derive parameters dynamically from observed data: scans for the
    /// range, then delegates to [`from_range`].
    ///
    /// [`from_range`]: QuantizationConfig::from_range
    pub fn from_data<F: Float>(data: &[F], symmetric: bool) -> Result<Self> {
        let mut min = F::infinity();
        let mut max = F::neg_infinity();
        for &v in data {
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
        if data.is_empty() {
            return Err(TensorError::invalid_argument(
                "QuantizationConfig::from_data",
                "cannot estimate parameters from an empty buffer",
            ));
        }
        Self::from_range(
            min.to_f32().unwrap_or(0.0),
            max.to_f32().unwrap_or(0.0),
            symmetric,
        )
    }

    pub fn effective_zero_point(&self) -> i32 {
        if self.symmetric {
            SYMMETRIC_ZERO_POINT
        } else {
            self.zero_point
        }
    }
}

/// `clamp(round(value / scale + zero_point), 0, 255)`.
pub fn quantize(value: f32, config: &QuantizationConfig) -> u8 {
    let zp = config.effective_zero_point() as f32;
    (value / config.scale + zp).round().clamp(0.0, 255.0) as u8
}

/// `scale * (code - zero_point)`.
pub fn dequantize(code: u8, config: &QuantizationConfig) -> f32 {
    config.scale * (code as i32 - config.effective_zero_point()) as f32
}

/// Pack two 4-bit codes into one byte, low nibble first. Values outside
/// `[0, 15]` are a usage error, never silently truncated.
pub fn pack_nibbles(lo: u8, hi: u8) -> Result<u8> {
    if lo > 0x0F || hi > 0x0F {
        return Err(TensorError::invalid_argument(
            "pack_nibbles",
            format!("nibble values must be in [0, 15], got ({lo}, {hi})"),
        ));
    }
    Ok((hi << 4) | lo)
}

/// Lossless inverse of [`pack_nibbles`]: returns `(lo, hi)`.
pub fn unpack_nibbles(byte: u8) -> (u8, u8) {
    (byte & 0x0F, byte >> 4)
}

/// Pack an even-length sequence of 4-bit codes. An odd length is a usage
/// error.
pub fn pack_4bit(codes: &[u8]) -> Result<Vec<u8>> {
    if codes.len() % 2 != 0 {
        return Err(TensorError::invalid_argument(
            "pack_4bit",
            format!("code count must be even, got {}", codes.len()),
        ));
    }
    codes
        .chunks_exact(2)
        .map(|pair| pack_nibbles(pair[0], pair[1]))
        .collect()
}

/// Unpack a packed buffer back into twice as many 4-bit codes.
pub fn unpack_4bit(packed: &[u8]) -> Vec<u8> {
    let mut codes = Vec::with_capacity(packed.len() * 2);
    for &byte in packed {
        let (lo, hi) = unpack_nibbles(byte);
        codes.push(lo);
        codes.push(hi);
    }
    codes
}

/// Fused unpack-then-dequantize producing element-type output in one pass.
pub fn dequantize_4bit_weights<T: Arithmetic>(
    packed: &[u8],
    config: &QuantizationConfig,
) -> Vec<T> {
    let mut out = Vec::with_capacity(packed.len() * 2);
    for &byte in packed {
        let (lo, hi) = unpack_nibbles(byte);
        out.push(T::from_f32(dequantize(lo, config)));
        out.push(T::from_f32(dequantize(hi, config)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_nibble_round_trip_all_bytes() {
        for byte in 0..=u8::MAX {
            let (lo, hi) = unpack_nibbles(byte);
            assert_eq!(pack_nibbles(lo, hi).unwrap(), byte);
        }
    }

    #[test]
    fn test_pack_rejects_out_of_range_values() {
        assert!(pack_nibbles(16, 0).is_err());
        assert!(pack_nibbles(0, 255).is_err());
        assert!(pack_4bit(&[1, 2, 3]).is_err()); // odd length
        assert_eq!(pack_4bit(&[2, 1]).unwrap(), vec![0x12]);
    }

    #[test]
    fn test_unpack_4bit_doubles_length() {
        let codes = unpack_4bit(&[0x12, 0xAB]);
        assert_eq!(codes, vec![2, 1, 0xB, 0xA]);
        assert_eq!(pack_4bit(&codes).unwrap(), vec![0x12, 0xAB]);
    }

    #[test]
    fn test_packed_byte_0x12_scenario() {
        // 0x12 unpacks to nibbles (2, 1); at scale 0.1 symmetric they
        // dequantize to 0.1*(2-128) and 0.1*(1-128)
        let (lo, hi) = unpack_nibbles(0x12);
        assert_eq!((lo, hi), (2, 1));
        let config = QuantizationConfig::symmetric(0.1).unwrap();
        assert_abs_diff_eq!(dequantize(lo, &config), -12.6, epsilon = 1e-5);
        assert_abs_diff_eq!(dequantize(hi, &config), -12.7, epsilon = 1e-5);

        let values = dequantize_4bit_weights::<f32>(&[0x12], &config);
        assert_abs_diff_eq!(values[0], -12.6, epsilon = 1e-5);
        assert_abs_diff_eq!(values[1], -12.7, epsilon = 1e-5);
    }

    #[test]
    fn test_quantization_error_within_one_step() {
        let symmetric = QuantizationConfig::from_range(-3.0, 3.0, true).unwrap();
        let asymmetric = QuantizationConfig::from_range(-1.0, 5.0, false).unwrap();
        for config in [&symmetric, &asymmetric] {
            let mut x = -1.0f32;
            while x <= 3.0 {
                let restored = dequantize(quantize(x, config), config);
                assert!(
                    (x - restored).abs() <= config.scale,
                    "error for {x} exceeds one step ({} vs {restored})",
                    config.scale
                );
                x += 0.0137;
            }
        }
    }

    #[test]
    fn test_symmetric_range_maps_to_code_extremes() {
        let config = QuantizationConfig::from_range(-2.0, 2.0, true).unwrap();
        assert_abs_diff_eq!(config.scale, 2.0 / 127.0);
        assert_eq!(quantize(-2.0, &config), 1);
        assert_eq!(quantize(0.0, &config), 128);
        assert_eq!(quantize(2.0, &config), 255);
    }

    #[test]
    fn test_asymmetric_range_maps_to_code_extremes() {
        let config = QuantizationConfig::from_range(-2.0, 6.0, false).unwrap();
        assert_eq!(config.zero_point, 64);
        assert_eq!(quantize(-2.0, &config), 0);
        assert_eq!(quantize(6.0, &config), 255);
        // values beyond the observed range clamp instead of wrapping
        assert_eq!(quantize(100.0, &config), 255);
        assert_eq!(quantize(-100.0, &config), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(QuantizationConfig::new(0.0, 0, true).is_err());
        assert!(QuantizationConfig::new(-0.5, 0, false).is_err());
        assert!(QuantizationConfig::asymmetric(0.1, 300).is_err());
        assert!(QuantizationConfig::asymmetric(0.1, -1).is_err());
        // the zero point is ignored, and not validated, in symmetric mode
        assert!(QuantizationConfig::new(0.1, 999, true).is_ok());
        assert_eq!(
            QuantizationConfig::new(0.1, 999, true)
                .unwrap()
                .effective_zero_point(),
            SYMMETRIC_ZERO_POINT
        );
    }

    #[test]
    fn test_degenerate_ranges_are_errors() {
        assert!(QuantizationConfig::from_range(0.0, 0.0, true).is_err());
        assert!(QuantizationConfig::from_range(2.0, 2.0, false).is_err());
        assert!(QuantizationConfig::from_range(3.0, 1.0, false).is_err());
    }

    #[test]
    fn test_from_data_estimates_range() {
        let config = QuantizationConfig::from_data(&[0.5f32, -1.5, 1.0], true).unwrap();
        assert_abs_diff_eq!(config.scale, 1.5 / 127.0);
        assert!(QuantizationConfig::from_data::<f32>(&[], true).is_err());
    }

    #[test]
    fn test_dequantize_4bit_into_integer_elements() {
        let config = QuantizationConfig::symmetric(1.0).unwrap();
        // codes (2, 1) dequantize to -126 and -127, representable in i8
        let values = dequantize_4bit_weights::<i8>(&[0x12], &config);
        assert_eq!(values, vec![-126, -127]);
    }
}
