//! GPU backend abstraction layer.
//!
//! The binding layer never talks to a graphics API directly. Everything it needs
//! from the device goes through the object-safe [`BindingBackend`] trait, in
//! terms of opaque handles:
//! - buffers and their uploads
//! - descriptor set layouts, pools and sets
//! - pipeline layouts and native graphics/compute pipelines
//! - command buffers and the `cmd_*` bind commands
//!
//! # Available Backends
//!
//! - `dummy` (always built): records every call, used by the tests
//! - `vulkan-backend`: native Vulkan backend using ash and gpu-allocator
//!
//! Images, samplers and shader modules are created outside of this layer. Each
//! backend provides its own way to import them as handles.

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub mod dummy;
mod error;

use bindery_core::DataType;

use crate::reflection::ShaderStageFlags;
use crate::state::GraphicsState;

pub use dummy::DummyBackend;
pub use error::BackendError;
#[cfg(feature = "vulkan-backend")]
pub use vulkan::VulkanBindingBackend;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Backend-specific identifier.
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

define_handle!(
    /// Handle to a GPU buffer.
    BufferHandle
);
define_handle!(
    /// Handle to a descriptor set layout.
    DescriptorSetLayoutHandle
);
define_handle!(
    /// Handle to a descriptor pool.
    DescriptorPoolHandle
);
define_handle!(
    /// Handle to a descriptor set.
    DescriptorSetHandle
);
define_handle!(
    /// Handle to a pipeline layout.
    PipelineLayoutHandle
);
define_handle!(
    /// Handle to a native graphics or compute pipeline.
    PipelineHandle
);
define_handle!(
    /// Handle to a command buffer.
    CommandBufferHandle
);
define_handle!(
    /// Handle to an image view usable in a descriptor.
    ImageHandle
);
define_handle!(
    /// Handle to a sampler.
    SamplerHandle
);
define_handle!(
    /// Handle to a compiled shader module.
    ShaderModuleHandle
);

// ============================================================================
// Descriptors
// ============================================================================

bitflags::bitflags! {
    /// How a buffer is going to be bound.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const UNIFORM = 1 << 1;
        const STORAGE = 1 << 2;
    }
}

/// Parameters of a host-visible buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    /// Rewritten every frame.
    pub dynamic: bool,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            dynamic: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }
}

/// Descriptor type of a descriptor set slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    StorageImage,
}

/// One slot of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorLayoutEntry {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub stages: ShaderStageFlags,
}

/// Number of descriptors of one kind a pool can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorPoolSize {
    pub kind: DescriptorKind,
    pub count: u32,
}

/// A single descriptor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorWrite {
    Buffer {
        binding: u32,
        kind: DescriptorKind,
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Image {
        binding: u32,
        kind: DescriptorKind,
        image: ImageHandle,
        sampler: Option<SamplerHandle>,
    },
}

impl DescriptorWrite {
    /// Slot written.
    pub fn binding(&self) -> u32 {
        match self {
            Self::Buffer { binding, .. } | Self::Image { binding, .. } => *binding,
        }
    }
}

/// A push-constant range of a pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

// ============================================================================
// Vertex input
// ============================================================================

/// Native vertex attribute format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
}

impl VertexFormat {
    /// Format matching `data_type`, if the type can feed a vertex attribute.
    pub fn from_data_type(data_type: DataType) -> Option<Self> {
        let format = match data_type {
            DataType::Float => Self::Float32,
            DataType::Vec2 => Self::Float32x2,
            DataType::Vec3 => Self::Float32x3,
            DataType::Vec4 => Self::Float32x4,
            DataType::Int => Self::Sint32,
            DataType::IVec2 => Self::Sint32x2,
            DataType::IVec3 => Self::Sint32x3,
            DataType::IVec4 => Self::Sint32x4,
            DataType::UInt => Self::Uint32,
            DataType::UVec2 => Self::Uint32x2,
            DataType::UVec3 => Self::Uint32x3,
            DataType::UVec4 => Self::Uint32x4,
            DataType::Mat4 => return None,
        };
        Some(format)
    }
}

/// Per-vertex or per-instance stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexInputRate {
    Vertex,
    Instance,
}

/// A vertex buffer binding of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBindingDesc {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

/// A vertex attribute read from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeDesc {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

// ============================================================================
// Pipelines
// ============================================================================

/// Render target size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Extent2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Everything needed to create a native graphics pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    pub layout: PipelineLayoutHandle,
    pub vertex: ShaderModuleHandle,
    pub fragment: ShaderModuleHandle,
    pub vertex_bindings: Vec<VertexBindingDesc>,
    pub vertex_attributes: Vec<VertexAttributeDesc>,
    pub state: GraphicsState,
    pub extent: Extent2d,
}

/// Everything needed to create a native compute pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub layout: PipelineLayoutHandle,
    pub module: ShaderModuleHandle,
}

/// Pipeline type a command binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

// ============================================================================
// Backend trait
// ============================================================================

/// Device operations used by the binding layer.
///
/// Methods take `&self`; implementations keep their object tables behind
/// interior mutability so one backend can be shared by every pipeline. Destroy
/// calls on unknown handles are ignored.
pub trait BindingBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Create a host-visible buffer.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, BackendError>;

    /// Copy `data` into `buffer` at `offset`.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8])
    -> Result<(), BackendError>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_descriptor_set_layout(
        &self,
        entries: &[DescriptorLayoutEntry],
    ) -> Result<DescriptorSetLayoutHandle, BackendError>;

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[DescriptorPoolSize],
    ) -> Result<DescriptorPoolHandle, BackendError>;

    /// Destroy `pool` and every set allocated from it.
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);

    /// Allocate `count` sets of `layout` from `pool`.
    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>, BackendError>;

    fn update_descriptor_set(
        &self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> Result<(), BackendError>;

    fn create_pipeline_layout(
        &self,
        set_layout: DescriptorSetLayoutHandle,
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutHandle, BackendError>;

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle);

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> Result<PipelineHandle, BackendError>;

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> Result<PipelineHandle, BackendError>;

    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn allocate_command_buffers(&self, count: u32)
    -> Result<Vec<CommandBufferHandle>, BackendError>;

    fn free_command_buffers(&self, buffers: &[CommandBufferHandle]);

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<(), BackendError>;

    /// Start recording `cmd` for use with a pipeline of type `bind_point`.
    fn begin_commands(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
    ) -> Result<(), BackendError>;

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) -> Result<(), BackendError>;

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: CommandBufferHandle,
        first_binding: u32,
        buffers: &[BufferHandle],
        offsets: &[u64],
    ) -> Result<(), BackendError>;

    fn cmd_push_constants(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_format_from_data_type() {
        assert_eq!(
            VertexFormat::from_data_type(DataType::Vec3),
            Some(VertexFormat::Float32x3)
        );
        assert_eq!(
            VertexFormat::from_data_type(DataType::UVec2),
            Some(VertexFormat::Uint32x2)
        );
        assert_eq!(VertexFormat::from_data_type(DataType::Mat4), None);
    }

    #[test]
    fn test_extent_display() {
        assert_eq!(Extent2d::new(640, 480).to_string(), "640x480");
    }

    #[test]
    fn test_descriptor_write_binding() {
        let write = DescriptorWrite::Image {
            binding: 4,
            kind: DescriptorKind::StorageImage,
            image: ImageHandle(1),
            sampler: None,
        };
        assert_eq!(write.binding(), 4);
    }
}
