//! 8-bit E4M3 float: 1 sign bit, 4 exponent bits (bias 7), 3 mantissa bits.
//!
//! Largest finite magnitude is 448; encoding saturates there instead of
//! producing an infinity (E4M3 has none). The all-ones pattern `S.1111.111`
//! is NaN. Exponent 0 holds subnormals with an effective exponent of -6.

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

const EXP_BIAS: i32 = 7;
const MIN_NORMAL_EXP: i32 = 1 - EXP_BIAS;
const MAX_NORMAL_EXP: i32 = 8;
const MAX_FINITE: f32 = 448.0;
const MAX_BITS: u8 = 0x7E;
const NAN_BITS: u8 = 0x7F;

/// A byte-sized E4M3 float stored by bit pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Float8(u8);

impl Float8 {
    pub const ZERO: Self = Float8(0x00);
    pub const ONE: Self = Float8(0x38);
    pub const MAX: Self = Float8(MAX_BITS);
    pub const NAN: Self = Float8(NAN_BITS);

    pub const fn from_bits(bits: u8) -> Self {
        Float8(bits)
    }

    pub const fn to_bits(self) -> u8 {
        self.0
    }

    pub fn is_nan(self) -> bool {
        self.0 & 0x7F == NAN_BITS
    }

    pub fn is_zero(self) -> bool {
        self.0 & 0x7F == 0
    }

    pub fn to_f32(self) -> f32 {
        if self.is_nan() {
            return f32::NAN;
        }
        let sign = if self.0 & 0x80 != 0 { -1.0 } else { 1.0 };
        let exp = ((self.0 >> 3) & 0x0F) as i32;
        let mant = (self.0 & 0x07) as f32;
        let magnitude = if exp == 0 {
            (mant / 8.0) * (MIN_NORMAL_EXP as f32).exp2()
        } else {
            (1.0 + mant / 8.0) * ((exp - EXP_BIAS) as f32).exp2()
        };
        sign * magnitude
    }

    /// Round-to-nearest encoding; overflow saturates to ±448, underflow
    /// flushes to zero.
    pub fn from_f32(value: f32) -> Self {
        if value.is_nan() {
            return Self::NAN;
        }
        let sign = if value.is_sign_negative() { 0x80u8 } else { 0x00 };
        let a = value.abs();
        if a == 0.0 {
            return Self::ZERO;
        }
        if a >= MAX_FINITE {
            return Float8(sign | MAX_BITS);
        }
        let exp = a.log2().floor() as i32;
        if exp < MIN_NORMAL_EXP {
            // subnormal: magnitude = mant/8 * 2^-6
            let mant = (a * 512.0).round() as u32;
            if mant == 0 {
                return Self::ZERO;
            }
            if mant >= 8 {
                // rounds up into the smallest normal
                return Float8(sign | 0x08);
            }
            return Float8(sign | mant as u8);
        }
        let exp = exp.min(MAX_NORMAL_EXP);
        let mut mant = ((a / (exp as f32).exp2() - 1.0) * 8.0).round() as i32;
        let mut exp = exp;
        if mant < 0 {
            mant = 0;
        }
        if mant >= 8 {
            mant = 0;
            exp += 1;
            if exp > MAX_NORMAL_EXP {
                return Float8(sign | MAX_BITS);
            }
        }
        Float8(sign | (((exp + EXP_BIAS) as u8) << 3) | mant as u8)
    }
}

impl std::fmt::Display for Float8 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_f32())
    }
}
