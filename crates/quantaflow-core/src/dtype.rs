#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

/// The closed set of element representations the framework is instantiated
/// for. Every [`crate::Arithmetic`] implementation names its own variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum DType {
    Float16, // Half precision IEEE 754-2008
    Float32,
    Float64,
    Float8, // E4M3 byte float
    Int8,
    UInt8,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::Float16 => 2,
            DType::Float32 => 4,
            DType::Float64 => 8,
            DType::Float8 => 1,
            DType::Int8 => 1,
            DType::UInt8 => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Float8 => "float8",
            DType::Int8 => "int8",
            DType::UInt8 => "uint8",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DType::Float16 | DType::Float32 | DType::Float64 | DType::Float8
        )
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::Float64.size(), 8);
        assert_eq!(DType::Float32.size(), 4);
        assert_eq!(DType::Float16.size(), 2);
        assert_eq!(DType::Float8.size(), 1);
        assert_eq!(DType::Int8.size(), 1);
        assert_eq!(DType::UInt8.size(), 1);
    }

    #[test]
    fn test_dtype_names() {
        assert_eq!(DType::Float8.name(), "float8");
        assert_eq!(DType::UInt8.to_string(), "uint8");
        assert!(DType::Float8.is_float());
        assert!(!DType::Int8.is_float());
    }
}
