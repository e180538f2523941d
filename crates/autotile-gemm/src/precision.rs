//! Precision model: maps a precision label to an element type and width.
//!
//! | Labels (case-insensitive)         | [`Precision`]    | Element type  | Width |
//! |-----------------------------------|------------------|---------------|-------|
//! | `fp32`, `float32`, `32`           | [`Precision::F32`]  | `f32`         | 4     |
//! | `fp16`, `float16`, `16`, `half`   | [`Precision::F16`]  | [`half::f16`] | 2     |
//! | `bf16`, `bfloat16`                | [`Precision::BF16`] | [`half::bf16`]| 2     |
//!
//! # Example
//!
//! ```
//! use autotile_gemm::{resolve_precision, Precision};
//!
//! let (precision, width) = resolve_precision("FP16").unwrap();
//! assert_eq!(precision, Precision::F16);
//! assert_eq!(width, 2);
//! assert!(resolve_precision("q8").is_err());
//! ```

use crate::error::{BenchError, Result};
use half::{bf16, f16};
use std::fmt;
use std::str::FromStr;

/// Floating-point precision of every tile in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    /// IEEE 754 single precision.
    F32,
    /// IEEE 754 half precision.
    F16,
    /// bfloat16 (8-bit exponent, 7-bit mantissa).
    BF16,
}

impl Precision {
    /// Size of one element in bytes.
    pub const fn element_width(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 | Precision::BF16 => 2,
        }
    }

    /// Canonical label.
    pub const fn label(self) -> &'static str {
        match self {
            Precision::F32 => "fp32",
            Precision::F16 => "fp16",
            Precision::BF16 => "bf16",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Precision {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "float32" | "32" => Ok(Precision::F32),
            "fp16" | "float16" | "16" | "half" => Ok(Precision::F16),
            "bf16" | "bfloat16" => Ok(Precision::BF16),
            _ => Err(BenchError::UnsupportedPrecision(s.to_string())),
        }
    }
}

/// Resolve a precision label to its precision and element width in bytes.
pub fn resolve_precision(label: &str) -> Result<(Precision, usize)> {
    let precision: Precision = label.parse()?;
    Ok((precision, precision.element_width()))
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for half::f16 {}
    impl Sealed for half::bf16 {}
}

/// Element types a tile can hold.
///
/// Kernels accumulate in `f32` regardless of the storage type, so every
/// element converts to and from `f32`.
pub trait Element: Copy + Default + Send + Sync + fmt::Debug + 'static + sealed::Sealed {
    /// Precision tag of this element type.
    const PRECISION: Precision;

    /// Additive identity.
    const ZERO: Self;

    /// Width in bytes.
    const WIDTH: usize = Self::PRECISION.element_width();

    /// Convert from `f32`, rounding to nearest.
    fn from_f32(value: f32) -> Self;

    /// Widen to `f32`.
    fn to_f32(self) -> f32;
}

impl Element for f32 {
    const PRECISION: Precision = Precision::F32;
    const ZERO: Self = 0.0;

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

/// Implements [`Element`] for the 16-bit `half` types.
macro_rules! impl_half_element {
    ($($ty:ty => $precision:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const PRECISION: Precision = $precision;
                const ZERO: Self = <$ty>::ZERO;

                #[inline]
                fn from_f32(value: f32) -> Self {
                    <$ty>::from_f32(value)
                }

                #[inline]
                fn to_f32(self) -> f32 {
                    <$ty>::to_f32(self)
                }
            }
        )*
    };
}

impl_half_element! {
    f16 => Precision::F16,
    bf16 => Precision::BF16,
}
