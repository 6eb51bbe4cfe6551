//! Block layout engine.
//!
//! Computes the byte offset, size and GPU stride of every field of a block for a
//! given packing standard. Fields are laid out in declaration order, each one at
//! the first offset satisfying its alignment. There is no reordering and no
//! trailing padding: the total size ends right after the last field.
//!
//! # Example
//!
//! ```ignore
//! let layout = compute_layout(
//!     &[
//!         FieldDecl::scalar(DataType::Float),
//!         FieldDecl::scalar(DataType::Vec3),
//!         FieldDecl::scalar(DataType::Mat4),
//!     ],
//!     PackingStandard::Std140,
//! );
//! assert_eq!(layout.size(), 96);
//! ```

use crate::types::{DataType, PackingStandard};

/// Declared shape of a block field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDecl {
    /// Element type.
    pub data_type: DataType,
    /// Number of array elements, 0 for a non-array field.
    pub count: u32,
}

impl FieldDecl {
    /// A single value.
    pub fn scalar(data_type: DataType) -> Self {
        Self { data_type, count: 0 }
    }

    /// An array of `count` values.
    pub fn array(data_type: DataType, count: u32) -> Self {
        Self { data_type, count }
    }

    /// Whether the field is an array.
    pub fn is_array(&self) -> bool {
        self.count > 0
    }

    /// Byte size of the field once packed.
    pub fn size(&self, standard: PackingStandard) -> u32 {
        if self.is_array() {
            self.count * self.data_type.array_stride(standard)
        } else {
            self.data_type.size()
        }
    }

    /// Required alignment of the field's first byte.
    pub fn align(&self, standard: PackingStandard) -> u32 {
        if self.is_array() {
            self.data_type.array_stride(standard)
        } else {
            self.data_type.align(standard)
        }
    }
}

/// Placement of one field inside its GPU buffer.
///
/// This is the only place a GPU stride is defined: block fields get theirs from
/// [`compute_layout`], standalone buffers from [`FieldInfo::standalone`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldInfo {
    /// Byte offset from the start of the buffer.
    pub offset: u32,
    /// Packed byte size.
    pub size: u32,
    /// Distance between consecutive array elements on the GPU.
    pub stride: u32,
}

impl FieldInfo {
    /// Placement of a buffer uploaded verbatim into its own GPU buffer.
    pub fn standalone(data_type: DataType, count: u32, data_stride: u32) -> Self {
        let stride = data_stride.max(data_type.size());
        Self {
            offset: 0,
            size: count.max(1) * stride,
            stride,
        }
    }

    /// First byte past the field.
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    /// Copy `data`, whose elements are `data_stride` bytes apart, into `dst` at
    /// this placement.
    ///
    /// A single copy is made when both strides agree. Otherwise each element is
    /// copied on its own, truncated to the smaller stride. Nothing is written past
    /// [`end`](Self::end) or past the end of `dst`.
    pub fn write(&self, dst: &mut [u8], data: &[u8], data_stride: u32) {
        let start = self.offset as usize;
        let end = (self.end() as usize).min(dst.len());
        if start >= end {
            return;
        }
        let dst = &mut dst[start..end];

        let data_stride = data_stride as usize;
        let gpu_stride = self.stride as usize;
        if data_stride == gpu_stride || data_stride == 0 || gpu_stride == 0 {
            let len = data.len().min(dst.len());
            dst[..len].copy_from_slice(&data[..len]);
            return;
        }

        let elem = data_stride.min(gpu_stride);
        for (src, out) in data.chunks(data_stride).zip(dst.chunks_mut(gpu_stride)) {
            let len = elem.min(src.len()).min(out.len());
            out[..len].copy_from_slice(&src[..len]);
        }
    }
}

/// Result of laying out a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    standard: PackingStandard,
    fields: Vec<FieldInfo>,
    size: u32,
}

impl BlockLayout {
    /// Packing standard used.
    pub fn standard(&self) -> PackingStandard {
        self.standard
    }

    /// Per-field placement, in declaration order.
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Placement of field `index`.
    pub fn field(&self, index: usize) -> Option<&FieldInfo> {
        self.fields.get(index)
    }

    /// Total packed size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// Lay out `fields` in order under `standard`.
///
/// # Panics
///
/// Panics if a field resolves to a zero alignment, which means the type table
/// is broken.
pub fn compute_layout(fields: &[FieldDecl], standard: PackingStandard) -> BlockLayout {
    let mut running = 0u32;
    let mut infos = Vec::with_capacity(fields.len());

    for field in fields {
        let size = field.size(standard);
        let align = field.align(standard);
        assert_ne!(align, 0, "zero alignment for {}", field.data_type);

        let offset = running.next_multiple_of(align);
        infos.push(FieldInfo {
            offset,
            size,
            stride: field.data_type.array_stride(standard),
        });
        running = offset + size;
    }

    BlockLayout {
        standard,
        fields: infos,
        size: running,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(layout: &BlockLayout) -> Vec<u32> {
        layout.fields().iter().map(|f| f.offset).collect()
    }

    #[test]
    fn test_float_vec3_mat4_std140() {
        let layout = compute_layout(
            &[
                FieldDecl::scalar(DataType::Float),
                FieldDecl::scalar(DataType::Vec3),
                FieldDecl::scalar(DataType::Mat4),
            ],
            PackingStandard::Std140,
        );
        assert_eq!(offsets(&layout), vec![0, 16, 32]);
        assert_eq!(layout.size(), 96);
    }

    #[test]
    fn test_scalars_pack_tightly() {
        let layout = compute_layout(
            &[
                FieldDecl::scalar(DataType::Float),
                FieldDecl::scalar(DataType::Int),
                FieldDecl::scalar(DataType::Vec2),
            ],
            PackingStandard::Std140,
        );
        assert_eq!(offsets(&layout), vec![0, 4, 8]);
        assert_eq!(layout.size(), 16);
    }

    #[test]
    fn test_vec3_followed_by_float_shares_slot() {
        let layout = compute_layout(
            &[
                FieldDecl::scalar(DataType::Vec3),
                FieldDecl::scalar(DataType::Float),
            ],
            PackingStandard::Std430,
        );
        assert_eq!(offsets(&layout), vec![0, 12]);
        assert_eq!(layout.size(), 16);
    }

    #[test]
    fn test_float_array_stride_differs_per_standard() {
        let fields = [FieldDecl::array(DataType::Float, 4)];

        let std140 = compute_layout(&fields, PackingStandard::Std140);
        assert_eq!(std140.fields()[0].stride, 16);
        assert_eq!(std140.size(), 64);

        let std430 = compute_layout(&fields, PackingStandard::Std430);
        assert_eq!(std430.fields()[0].stride, 4);
        assert_eq!(std430.size(), 16);
    }

    #[test]
    fn test_array_aligns_to_its_stride() {
        let layout = compute_layout(
            &[
                FieldDecl::scalar(DataType::Float),
                FieldDecl::array(DataType::Vec2, 2),
            ],
            PackingStandard::Std140,
        );
        assert_eq!(offsets(&layout), vec![0, 16]);
        assert_eq!(layout.size(), 48);
    }

    #[test]
    fn test_empty_block() {
        let layout = compute_layout(&[], PackingStandard::Std140);
        assert!(layout.fields().is_empty());
        assert_eq!(layout.size(), 0);
    }

    #[test]
    fn test_standalone_uses_source_stride() {
        let info = FieldInfo::standalone(DataType::Vec3, 10, 12);
        assert_eq!(info.offset, 0);
        assert_eq!(info.stride, 12);
        assert_eq!(info.size, 120);

        let padded = FieldInfo::standalone(DataType::Vec3, 10, 16);
        assert_eq!(padded.stride, 16);
        assert_eq!(padded.end(), 160);
    }

    #[test]
    fn test_write_expands_stride() {
        let info = FieldInfo {
            offset: 4,
            size: 32,
            stride: 16,
        };
        let data: Vec<u8> = (1..=24).collect();
        let mut dst = vec![0u8; 40];
        info.write(&mut dst, &data, 12);

        assert_eq!(&dst[4..16], &data[0..12]);
        assert_eq!(&dst[16..20], &[0, 0, 0, 0]);
        assert_eq!(&dst[20..32], &data[12..24]);
        assert_eq!(&dst[36..40], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_write_is_clamped() {
        let info = FieldInfo {
            offset: 6,
            size: 4,
            stride: 4,
        };
        let mut dst = vec![0u8; 8];
        info.write(&mut dst, &[9; 16], 4);
        assert_eq!(dst, vec![0, 0, 0, 0, 0, 0, 9, 9]);
    }
}
