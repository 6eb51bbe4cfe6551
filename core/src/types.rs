//! Type metrics for GPU block members.
//!
//! Every shader-visible value type has a fixed byte size and, under each packing
//! standard, a fixed alignment and array stride. The tables here are the single
//! source of truth for those numbers; the layout engine never computes them on
//! its own.
//!
//! | type      | size | align | std140 stride | std430 stride |
//! |-----------|------|-------|---------------|---------------|
//! | float     | 4    | 4     | 16            | 4             |
//! | vec2      | 8    | 8     | 16            | 8             |
//! | vec3      | 12   | 16    | 16            | 16            |
//! | vec4      | 16   | 16    | 16            | 16            |
//! | mat4      | 64   | 16    | 64            | 64            |
//!
//! Integer variants follow their float counterparts.

use std::fmt;

/// GPU block packing standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PackingStandard {
    /// Relaxed packing: array elements are rounded up to 16 bytes.
    #[default]
    Std140,
    /// Tight packing: array elements use their natural alignment.
    Std430,
}

impl PackingStandard {
    /// Name as written in shader layout qualifiers.
    pub fn name(self) -> &'static str {
        match self {
            Self::Std140 => "std140",
            Self::Std430 => "std430",
        }
    }
}

impl fmt::Display for PackingStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar, vector or matrix type of a block field or vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Int,
    IVec2,
    IVec3,
    IVec4,
    UInt,
    UVec2,
    UVec3,
    UVec4,
    /// 4x4 column-major float matrix.
    Mat4,
}

impl DataType {
    /// Number of 32-bit components.
    pub const fn component_count(self) -> u32 {
        match self {
            Self::Float | Self::Int | Self::UInt => 1,
            Self::Vec2 | Self::IVec2 | Self::UVec2 => 2,
            Self::Vec3 | Self::IVec3 | Self::UVec3 => 3,
            Self::Vec4 | Self::IVec4 | Self::UVec4 => 4,
            Self::Mat4 => 16,
        }
    }

    /// Byte size of a single value.
    pub const fn size(self) -> u32 {
        self.component_count() * 4
    }

    /// Alignment of a non-array field of this type.
    ///
    /// Both standards agree here: scalars and 2-component vectors align to their
    /// size, 3- and 4-component vectors and matrices align to 16 bytes.
    pub const fn align(self, _standard: PackingStandard) -> u32 {
        match self {
            Self::Float | Self::Int | Self::UInt => 4,
            Self::Vec2 | Self::IVec2 | Self::UVec2 => 8,
            Self::Vec3 | Self::IVec3 | Self::UVec3 => 16,
            Self::Vec4 | Self::IVec4 | Self::UVec4 => 16,
            Self::Mat4 => 16,
        }
    }

    /// Distance in bytes between two consecutive array elements.
    pub const fn array_stride(self, standard: PackingStandard) -> u32 {
        match (self, standard) {
            (Self::Mat4, _) => 64,
            (_, PackingStandard::Std140) => 16,
            (Self::Float | Self::Int | Self::UInt, PackingStandard::Std430) => 4,
            (Self::Vec2 | Self::IVec2 | Self::UVec2, PackingStandard::Std430) => 8,
            (_, PackingStandard::Std430) => 16,
        }
    }

    /// Whether this is a single scalar component.
    pub const fn is_scalar(self) -> bool {
        self.component_count() == 1
    }

    /// GLSL spelling of the type.
    pub fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Vec2 => "vec2",
            Self::Vec3 => "vec3",
            Self::Vec4 => "vec4",
            Self::Int => "int",
            Self::IVec2 => "ivec2",
            Self::IVec3 => "ivec3",
            Self::IVec4 => "ivec4",
            Self::UInt => "uint",
            Self::UVec2 => "uvec2",
            Self::UVec3 => "uvec3",
            Self::UVec4 => "uvec4",
            Self::Mat4 => "mat4",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DataType::Float.size(), 4);
        assert_eq!(DataType::Vec3.size(), 12);
        assert_eq!(DataType::UVec4.size(), 16);
        assert_eq!(DataType::Mat4.size(), 64);
    }

    #[test]
    fn test_alignment_same_for_both_standards() {
        for standard in [PackingStandard::Std140, PackingStandard::Std430] {
            assert_eq!(DataType::Float.align(standard), 4);
            assert_eq!(DataType::IVec2.align(standard), 8);
            assert_eq!(DataType::Vec3.align(standard), 16);
            assert_eq!(DataType::Mat4.align(standard), 16);
        }
    }

    #[test]
    fn test_array_stride_std140_rounds_to_16() {
        assert_eq!(DataType::Float.array_stride(PackingStandard::Std140), 16);
        assert_eq!(DataType::Vec2.array_stride(PackingStandard::Std140), 16);
        assert_eq!(DataType::UInt.array_stride(PackingStandard::Std140), 16);
        assert_eq!(DataType::Mat4.array_stride(PackingStandard::Std140), 64);
    }

    #[test]
    fn test_array_stride_std430_is_tight() {
        assert_eq!(DataType::Float.array_stride(PackingStandard::Std430), 4);
        assert_eq!(DataType::IVec2.array_stride(PackingStandard::Std430), 8);
        assert_eq!(DataType::Vec3.array_stride(PackingStandard::Std430), 16);
        assert_eq!(DataType::Mat4.array_stride(PackingStandard::Std430), 64);
    }

    #[test]
    fn test_display() {
        assert_eq!(DataType::UVec3.to_string(), "uvec3");
        assert_eq!(PackingStandard::Std430.to_string(), "std430");
    }
}
