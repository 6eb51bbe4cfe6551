//! Scene value sources.
//!
//! A value source is the CPU side of a block field, a uniform or a vertex
//! buffer: it exposes typed bytes plus a generation counter that moves every
//! time the bytes change. Sources are owned by the scene and shared with every
//! block or pipeline that reads them, so they live behind [`SharedSource`].
//!
//! Three sources cover the scene value kinds:
//! - [`UniformValue`] - a single scalar, vector or matrix, optionally animated
//! - [`BufferValue`] - a typed array with an explicit CPU stride
//! - [`QuaternionValue`] - a rotation exposed as vec4 or as a mat4

use std::fmt;
use std::sync::Arc;

use nalgebra::{Quaternion, UnitQuaternion};
use parking_lot::RwLock;

use crate::error::ConfigurationError;
use crate::layout::FieldDecl;
use crate::types::DataType;

/// CPU-side provider of a typed value.
pub trait ValueSource: Send + Sync + fmt::Debug {
    /// Type of one element.
    fn data_type(&self) -> DataType;

    /// Number of elements for array sources, `None` for a single value.
    fn element_count(&self) -> Option<u32> {
        None
    }

    /// Raw element bytes, `data_stride()` bytes apart.
    fn data(&self) -> &[u8];

    /// Distance in bytes between two elements of [`data`](Self::data).
    fn data_stride(&self) -> u32 {
        self.data_type().size()
    }

    /// Live sources are animated and always count as changed.
    fn is_live(&self) -> bool {
        false
    }

    /// Counter bumped on every mutation.
    fn generation(&self) -> u64;

    /// Advance the source to time `t` (seconds).
    fn update(&mut self, _t: f64) {}

    /// Field shape this source occupies in a block.
    fn decl(&self) -> FieldDecl {
        match self.element_count() {
            Some(count) => FieldDecl::array(self.data_type(), count),
            None => FieldDecl::scalar(self.data_type()),
        }
    }
}

/// A source shared between the scene and its consumers.
pub type SharedSource = Arc<RwLock<dyn ValueSource>>;

/// Wrap a source for sharing.
pub fn share<S: ValueSource + 'static>(source: S) -> SharedSource {
    Arc::new(RwLock::new(source))
}

// ============================================================================
// Values
// ============================================================================

/// A single typed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Int(i32),
    IVec2([i32; 2]),
    IVec3([i32; 3]),
    IVec4([i32; 4]),
    UInt(u32),
    UVec2([u32; 2]),
    UVec3([u32; 3]),
    UVec4([u32; 4]),
    Mat4([f32; 16]),
}

impl Value {
    /// Type tag of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Float(_) => DataType::Float,
            Self::Vec2(_) => DataType::Vec2,
            Self::Vec3(_) => DataType::Vec3,
            Self::Vec4(_) => DataType::Vec4,
            Self::Int(_) => DataType::Int,
            Self::IVec2(_) => DataType::IVec2,
            Self::IVec3(_) => DataType::IVec3,
            Self::IVec4(_) => DataType::IVec4,
            Self::UInt(_) => DataType::UInt,
            Self::UVec2(_) => DataType::UVec2,
            Self::UVec3(_) => DataType::UVec3,
            Self::UVec4(_) => DataType::UVec4,
            Self::Mat4(_) => DataType::Mat4,
        }
    }

    /// Native-endian bytes of the value.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Float(v) => bytemuck::bytes_of(v),
            Self::Vec2(v) => bytemuck::bytes_of(v),
            Self::Vec3(v) => bytemuck::bytes_of(v),
            Self::Vec4(v) => bytemuck::bytes_of(v),
            Self::Int(v) => bytemuck::bytes_of(v),
            Self::IVec2(v) => bytemuck::bytes_of(v),
            Self::IVec3(v) => bytemuck::bytes_of(v),
            Self::IVec4(v) => bytemuck::bytes_of(v),
            Self::UInt(v) => bytemuck::bytes_of(v),
            Self::UVec2(v) => bytemuck::bytes_of(v),
            Self::UVec3(v) => bytemuck::bytes_of(v),
            Self::UVec4(v) => bytemuck::bytes_of(v),
            Self::Mat4(v) => bytemuck::bytes_of(v),
        }
    }
}

type Animation = Box<dyn Fn(f64) -> Value + Send + Sync>;

/// A single scalar, vector or matrix uniform.
pub struct UniformValue {
    value: Value,
    generation: u64,
    live: bool,
    animation: Option<Animation>,
}

impl UniformValue {
    /// Create a static uniform.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            generation: 0,
            live: false,
            animation: None,
        }
    }

    /// Create a uniform evaluated from `animation` at every update.
    ///
    /// Animated uniforms are live.
    pub fn animated<F>(initial: Value, animation: F) -> Self
    where
        F: Fn(f64) -> Value + Send + Sync + 'static,
    {
        Self {
            value: initial,
            generation: 0,
            live: true,
            animation: Some(Box::new(animation)),
        }
    }

    /// Mark the uniform live regardless of animation.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Current value.
    pub fn value(&self) -> Value {
        self.value
    }

    /// Replace the value. The type must not change.
    pub fn set(&mut self, value: Value) -> Result<(), ConfigurationError> {
        if value.data_type() != self.value.data_type() {
            return Err(ConfigurationError::TypeMismatch {
                expected: self.value.data_type(),
                found: value.data_type(),
            });
        }
        if value != self.value {
            self.value = value;
            self.generation += 1;
        }
        Ok(())
    }
}

impl fmt::Debug for UniformValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniformValue")
            .field("value", &self.value)
            .field("generation", &self.generation)
            .field("live", &self.live)
            .field("animated", &self.animation.is_some())
            .finish()
    }
}

impl ValueSource for UniformValue {
    fn data_type(&self) -> DataType {
        self.value.data_type()
    }

    fn data(&self) -> &[u8] {
        self.value.as_bytes()
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn update(&mut self, t: f64) {
        let Some(animation) = &self.animation else {
            return;
        };
        let value = animation(t);
        if let Err(err) = self.set(value) {
            log::warn!("animated uniform ignored at t={t}: {err}");
        }
    }
}

// ============================================================================
// Buffers
// ============================================================================

/// A typed array with an explicit CPU stride.
#[derive(Debug, Clone)]
pub struct BufferValue {
    data_type: DataType,
    data: Vec<u8>,
    data_stride: u32,
    count: u32,
    live: bool,
    generation: u64,
}

impl BufferValue {
    /// Create a buffer from raw bytes laid out `data_stride` bytes apart.
    pub fn new(
        data_type: DataType,
        data: Vec<u8>,
        data_stride: u32,
    ) -> Result<Self, ConfigurationError> {
        let count = validate(data_type, &data, data_stride)?;
        Ok(Self {
            data_type,
            data,
            data_stride,
            count,
            live: false,
            generation: 0,
        })
    }

    /// Create a buffer from a slice of plain values, one element per item.
    pub fn from_slice<T: bytemuck::Pod>(
        data_type: DataType,
        values: &[T],
    ) -> Result<Self, ConfigurationError> {
        Self::new(
            data_type,
            bytemuck::cast_slice(values).to_vec(),
            std::mem::size_of::<T>() as u32,
        )
    }

    /// Mark the buffer live: it is re-packed on every refresh.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Number of elements.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Replace the whole contents. The element count must not change.
    pub fn set_data(&mut self, data: Vec<u8>) -> Result<(), ConfigurationError> {
        if data.len() != self.data.len() {
            return Err(ConfigurationError::InvalidData {
                len: data.len(),
                stride: self.data_stride,
            });
        }
        self.data = data;
        self.generation += 1;
        Ok(())
    }

    /// Overwrite element `index` with `value`.
    pub fn set_element<T: bytemuck::Pod>(
        &mut self,
        index: u32,
        value: &T,
    ) -> Result<(), ConfigurationError> {
        let bytes = bytemuck::bytes_of(value);
        if index >= self.count || bytes.len() > self.data_stride as usize {
            return Err(ConfigurationError::InvalidData {
                len: bytes.len(),
                stride: self.data_stride,
            });
        }
        let start = index as usize * self.data_stride as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.generation += 1;
        Ok(())
    }
}

fn validate(data_type: DataType, data: &[u8], stride: u32) -> Result<u32, ConfigurationError> {
    if stride < data_type.size() {
        return Err(ConfigurationError::InvalidStride {
            stride,
            element_size: data_type.size(),
        });
    }
    if data.len() % stride as usize != 0 {
        return Err(ConfigurationError::InvalidData {
            len: data.len(),
            stride,
        });
    }
    Ok((data.len() / stride as usize) as u32)
}

impl ValueSource for BufferValue {
    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn element_count(&self) -> Option<u32> {
        Some(self.count)
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_stride(&self) -> u32 {
        self.data_stride
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

// ============================================================================
// Quaternions
// ============================================================================

/// A rotation uniform, exposed as `vec4(x, y, z, w)` or as a mat4.
#[derive(Debug, Clone)]
pub struct QuaternionValue {
    rotation: UnitQuaternion<f32>,
    as_mat4: bool,
    packed: [f32; 16],
    live: bool,
    generation: u64,
}

impl QuaternionValue {
    /// Create a quaternion uniform exposed as a vec4.
    pub fn new(rotation: UnitQuaternion<f32>) -> Self {
        let mut value = Self {
            rotation,
            as_mat4: false,
            packed: [0.0; 16],
            live: false,
            generation: 0,
        };
        value.pack();
        value
    }

    /// Create from `[x, y, z, w]` components, normalizing them.
    ///
    /// A zero-length quaternion has no rotation to normalize to and falls back
    /// to identity.
    pub fn from_components([x, y, z, w]: [f32; 4]) -> Self {
        let rotation = UnitQuaternion::try_new(Quaternion::new(w, x, y, z), f32::EPSILON)
            .unwrap_or_else(UnitQuaternion::identity);
        Self::new(rotation)
    }

    /// Expose the rotation as a 4x4 rotation matrix instead of a vec4.
    pub fn as_matrix(mut self) -> Self {
        self.as_mat4 = true;
        self.pack();
        self
    }

    /// Mark the quaternion live.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Current rotation.
    pub fn rotation(&self) -> UnitQuaternion<f32> {
        self.rotation
    }

    /// Replace the rotation.
    pub fn set(&mut self, rotation: UnitQuaternion<f32>) {
        if rotation != self.rotation {
            self.rotation = rotation;
            self.pack();
            self.generation += 1;
        }
    }

    fn pack(&mut self) {
        if self.as_mat4 {
            let matrix = self.rotation.to_homogeneous();
            self.packed.copy_from_slice(matrix.as_slice());
        } else {
            let coords = self.rotation.quaternion().coords;
            self.packed[..4].copy_from_slice(coords.as_slice());
        }
    }
}

impl ValueSource for QuaternionValue {
    fn data_type(&self) -> DataType {
        if self.as_mat4 {
            DataType::Mat4
        } else {
            DataType::Vec4
        }
    }

    fn data(&self) -> &[u8] {
        let len = if self.as_mat4 { 16 } else { 4 };
        bytemuck::cast_slice(&self.packed[..len])
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_set_bumps_generation() {
        let mut value = UniformValue::new(Value::Float(1.0));
        assert_eq!(value.generation(), 0);

        value.set(Value::Float(2.0)).unwrap();
        assert_eq!(value.generation(), 1);
        assert_eq!(value.data(), 2.0f32.to_ne_bytes());

        // Same value is not a change
        value.set(Value::Float(2.0)).unwrap();
        assert_eq!(value.generation(), 1);
    }

    #[test]
    fn test_uniform_type_mismatch() {
        let mut value = UniformValue::new(Value::Vec3([0.0; 3]));
        let err = value.set(Value::Float(1.0)).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::TypeMismatch {
                expected: DataType::Vec3,
                found: DataType::Float,
            }
        );
    }

    #[test]
    fn test_animated_uniform() {
        let mut value = UniformValue::animated(Value::Float(0.0), |t| Value::Float(t as f32 * 2.0));
        assert!(value.is_live());

        value.update(1.5);
        assert_eq!(value.value(), Value::Float(3.0));
        assert_eq!(value.generation(), 1);
    }

    #[test]
    fn test_buffer_from_slice() {
        let buffer = BufferValue::from_slice(DataType::Vec2, &[[1.0f32, 2.0], [3.0, 4.0]]).unwrap();
        assert_eq!(buffer.count(), 2);
        assert_eq!(buffer.data_stride(), 8);
        assert_eq!(buffer.element_count(), Some(2));
        assert_eq!(buffer.decl(), FieldDecl::array(DataType::Vec2, 2));
    }

    #[test]
    fn test_buffer_rejects_short_stride() {
        let err = BufferValue::new(DataType::Vec4, vec![0; 24], 12).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::InvalidStride {
                stride: 12,
                element_size: 16
            }
        );
    }

    #[test]
    fn test_buffer_rejects_partial_element() {
        let err = BufferValue::new(DataType::Float, vec![0; 6], 4).unwrap_err();
        assert_eq!(err, ConfigurationError::InvalidData { len: 6, stride: 4 });
    }

    #[test]
    fn test_buffer_set_element() {
        let mut buffer = BufferValue::from_slice(DataType::Float, &[0.0f32; 3]).unwrap();
        buffer.set_element(1, &5.0f32).unwrap();
        assert_eq!(buffer.generation(), 1);
        assert_eq!(&buffer.data()[4..8], &5.0f32.to_ne_bytes());
        assert!(buffer.set_element(3, &1.0f32).is_err());
    }

    #[test]
    fn test_quaternion_as_vec4() {
        let quat = QuaternionValue::from_components([0.0, 0.0, 0.0, 1.0]);
        assert_eq!(quat.data_type(), DataType::Vec4);
        let floats: &[f32] = bytemuck::cast_slice(quat.data());
        assert_eq!(floats, &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_quaternion_zero_components_is_identity() {
        let quat = QuaternionValue::from_components([0.0; 4]);
        let floats: &[f32] = bytemuck::cast_slice(quat.data());
        assert_eq!(floats, &[0.0, 0.0, 0.0, 1.0]);

        let scaled = QuaternionValue::from_components([0.0, 0.0, 0.0, 2.0]);
        let floats: &[f32] = bytemuck::cast_slice(scaled.data());
        assert_eq!(floats, &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_quaternion_as_mat4_identity() {
        let quat = QuaternionValue::new(UnitQuaternion::identity()).as_matrix();
        assert_eq!(quat.data_type(), DataType::Mat4);
        let floats: &[f32] = bytemuck::cast_slice(quat.data());
        assert_eq!(floats.len(), 16);
        for (i, v) in floats.iter().enumerate() {
            let expected = if i % 5 == 0 { 1.0 } else { 0.0 };
            assert_eq!(*v, expected);
        }
    }
}
