//! Block configuration errors.

use std::fmt;

use crate::types::{DataType, PackingStandard};

/// Errors raised while building a block or feeding a value source.
///
/// All of these are fatal to the object being built; no partial state is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The device supports neither buffer object kind required by the standard.
    UnsupportedStandard {
        block: String,
        standard: PackingStandard,
    },
    /// An array field has no elements.
    EmptyArray { block: String, field: usize },
    /// A value of the wrong type was written into a source.
    TypeMismatch {
        expected: DataType,
        found: DataType,
    },
    /// A CPU array stride is smaller than one element.
    InvalidStride { stride: u32, element_size: u32 },
    /// Array data is not a whole number of strides.
    InvalidData { len: usize, stride: u32 },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedStandard { block, standard } => {
                write!(f, "{standard} blocks are not supported by this device ({block})")
            }
            Self::EmptyArray { block, field } => {
                write!(f, "{block}.field[{field}] is an empty array")
            }
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            Self::InvalidStride {
                stride,
                element_size,
            } => write!(
                f,
                "stride {stride} is smaller than the element size {element_size}"
            ),
            Self::InvalidData { len, stride } => {
                write!(f, "data length {len} is not a multiple of stride {stride}")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigurationError::UnsupportedStandard {
            block: "lights".to_string(),
            standard: PackingStandard::Std430,
        };
        assert_eq!(
            err.to_string(),
            "std430 blocks are not supported by this device (lights)"
        );

        let err = ConfigurationError::TypeMismatch {
            expected: DataType::Vec3,
            found: DataType::Float,
        };
        assert_eq!(err.to_string(), "type mismatch: expected vec3, found float");
    }
}
