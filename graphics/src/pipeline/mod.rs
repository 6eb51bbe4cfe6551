//! Pipelines and the resources bound to them.
//!
//! A [`Pipeline`] is built from a [`PipelineDescriptor`]: a shader program with
//! its per-stage reflection, the named scene resources to bind, and the fixed
//! graphics state. [`Pipeline::build`] resolves every name once and keeps the
//! result as indexed binding tables; the per-frame path in [`crate::frame`]
//! only walks those tables.
//!
//! # Example
//!
//! ```ignore
//! let program = ShaderProgram::graphics(
//!     ShaderStageProgram::new(vertex_module, vertex_reflection),
//!     ShaderStageProgram::new(fragment_module, fragment_reflection),
//! );
//! let resources = PipelineResources::new()
//!     .with_uniform("color", color.clone())
//!     .with_texture("tex0", texture.clone())
//!     .with_attribute("ngl_position", positions.clone());
//!
//! let mut pipeline = Pipeline::build(&backend, &ctx, PipelineDescriptor::new(program).with_resources(resources))?;
//! pipeline.update(&backend, t, extent)?;
//! let cmd = pipeline.bind_frame(&backend, frame_index, &transforms)?;
//! ```

mod resolver;

use bindery_core::{FieldInfo, SharedSource};

use crate::backend::{
    BindingBackend, BufferHandle, CommandBufferHandle, DescriptorKind, DescriptorPoolHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, Extent2d, PipelineBindPoint, PipelineHandle,
    PipelineLayoutHandle, PushConstantRange, ShaderModuleHandle, VertexAttributeDesc,
    VertexBindingDesc,
};
use crate::error::BindingError;
use crate::frame::RegionStamp;
use crate::reflection::{ShaderStage, ShaderStageFlags, StageReflection};
use crate::resources::{SharedBlock, SharedBuffer, SharedTexture};
use crate::state::GraphicsState;

/// Vertex attribute names every scene geometry is expected to provide.
pub const RESERVED_ATTRIBUTES: [&str; 3] = ["ngl_position", "ngl_uvcoord", "ngl_normal"];

// ============================================================================
// Program
// ============================================================================

/// One compiled stage with its reflection.
#[derive(Debug, Clone)]
pub struct ShaderStageProgram {
    pub module: ShaderModuleHandle,
    pub reflection: StageReflection,
}

impl ShaderStageProgram {
    pub fn new(module: ShaderModuleHandle, reflection: StageReflection) -> Self {
        Self { module, reflection }
    }
}

/// Stages of a program.
#[derive(Debug, Clone)]
pub enum ShaderProgram {
    Graphics {
        vertex: ShaderStageProgram,
        fragment: ShaderStageProgram,
    },
    Compute(ShaderStageProgram),
}

impl ShaderProgram {
    pub fn graphics(vertex: ShaderStageProgram, fragment: ShaderStageProgram) -> Self {
        Self::Graphics { vertex, fragment }
    }

    pub fn compute(stage: ShaderStageProgram) -> Self {
        Self::Compute(stage)
    }

    pub fn bind_point(&self) -> PipelineBindPoint {
        match self {
            Self::Graphics { .. } => PipelineBindPoint::Graphics,
            Self::Compute(_) => PipelineBindPoint::Compute,
        }
    }

    /// Stages paired with the stage each one must reflect.
    fn expected_stages(&self) -> Vec<(&ShaderStageProgram, ShaderStage)> {
        match self {
            Self::Graphics { vertex, fragment } => vec![
                (vertex, ShaderStage::Vertex),
                (fragment, ShaderStage::Fragment),
            ],
            Self::Compute(stage) => vec![(stage, ShaderStage::Compute)],
        }
    }

    /// Reflection of every stage, checked against the program kind.
    pub(crate) fn reflections(&self) -> Result<Vec<StageReflection>, BindingError> {
        self.expected_stages()
            .into_iter()
            .map(|(program, expected)| {
                if program.reflection.stage == expected {
                    Ok(program.reflection.clone())
                } else {
                    Err(BindingError::MissingStage(expected))
                }
            })
            .collect()
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Named scene resources offered to a pipeline.
///
/// Names are matched against the reflected interface at build time. Resources
/// the program does not reference are skipped.
#[derive(Debug, Clone, Default)]
pub struct PipelineResources {
    pub(crate) uniforms: Vec<(String, SharedSource)>,
    pub(crate) blocks: Vec<(String, SharedBlock)>,
    pub(crate) textures: Vec<(String, SharedTexture)>,
    pub(crate) attributes: Vec<(String, SharedBuffer)>,
    pub(crate) instance_attributes: Vec<(String, SharedBuffer)>,
}

impl PipelineResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// A value packed into the uniform block declaring a member `name`.
    pub fn with_uniform(mut self, name: impl Into<String>, source: SharedSource) -> Self {
        self.uniforms.push((name.into(), source));
        self
    }

    /// A block bound to the uniform or storage block named `name`.
    pub fn with_block(mut self, name: impl Into<String>, block: SharedBlock) -> Self {
        self.blocks.push((name.into(), block));
        self
    }

    /// A texture bound through the `<name>_sampler` slot.
    pub fn with_texture(mut self, name: impl Into<String>, texture: SharedTexture) -> Self {
        self.textures.push((name.into(), texture));
        self
    }

    /// A per-vertex attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, buffer: SharedBuffer) -> Self {
        self.attributes.push((name.into(), buffer));
        self
    }

    /// A per-instance attribute.
    pub fn with_instance_attribute(mut self, name: impl Into<String>, buffer: SharedBuffer) -> Self {
        self.instance_attributes.push((name.into(), buffer));
        self
    }
}

/// Everything needed to build a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub label: Option<String>,
    pub program: ShaderProgram,
    pub resources: PipelineResources,
    pub state: GraphicsState,
}

impl PipelineDescriptor {
    pub fn new(program: ShaderProgram) -> Self {
        Self {
            label: None,
            program,
            resources: PipelineResources::default(),
            state: GraphicsState::default(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_resources(mut self, resources: PipelineResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_state(mut self, state: GraphicsState) -> Self {
        self.state = state;
        self
    }
}

// ============================================================================
// Resolved bindings
// ============================================================================

/// A uniform packed into the per-frame uniform region.
#[derive(Debug)]
pub(crate) struct UniformPair {
    pub source: SharedSource,
    /// Placement relative to the start of a frame region.
    pub info: FieldInfo,
}

/// A texture and its companion uniform offsets in the uniform region.
#[derive(Debug)]
pub(crate) struct TexturePair {
    pub texture: SharedTexture,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub coord_matrix: Option<u32>,
    pub dimensions: Option<u32>,
    pub timestamp: Option<u32>,
}

/// A shared block bound at offset 0 of its own buffer.
#[derive(Debug)]
pub(crate) struct BlockPair {
    pub block: SharedBlock,
    pub binding: u32,
    pub kind: DescriptorKind,
}

/// A uniform block packed into the pipeline's uniform buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBlockInfo {
    pub binding: u32,
    /// Offset inside a frame region.
    pub offset: u64,
    pub size: u64,
}

/// Lifecycle of the native pipeline object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStatus {
    /// Built, waiting for the first update to create the native pipeline.
    Unbound,
    /// Native pipeline matches the current extent.
    Bound,
    /// Native pipeline is being recreated.
    DirtyRebuild,
}

// ============================================================================
// Pipeline
// ============================================================================

/// A program bound to scene resources.
///
/// Must be torn down with [`release`](Self::release) before the backend goes
/// away.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) label: String,
    pub(crate) program: ShaderProgram,
    pub(crate) graphics_state: GraphicsState,
    pub(crate) frames: u32,

    pub(crate) set_layout: DescriptorSetLayoutHandle,
    pub(crate) pipeline_layout: PipelineLayoutHandle,
    pub(crate) descriptor_pool: DescriptorPoolHandle,
    pub(crate) descriptor_sets: Vec<DescriptorSetHandle>,
    pub(crate) push_constants: Vec<PushConstantRange>,
    pub(crate) transform_stages: ShaderStageFlags,
    pub(crate) transform_size: u32,

    pub(crate) uniform_buffer: Option<BufferHandle>,
    pub(crate) region_size: u64,
    pub(crate) staging: Vec<u8>,
    pub(crate) region_stamps: Vec<Option<RegionStamp>>,
    pub(crate) packed_blocks: Vec<PackedBlockInfo>,

    pub(crate) uniforms: Vec<UniformPair>,
    pub(crate) textures: Vec<TexturePair>,
    pub(crate) blocks: Vec<BlockPair>,
    pub(crate) vertex_buffers: Vec<SharedBuffer>,
    pub(crate) vertex_bindings: Vec<VertexBindingDesc>,
    pub(crate) vertex_attributes: Vec<VertexAttributeDesc>,

    pub(crate) native: Option<PipelineHandle>,
    pub(crate) command_buffers: Vec<CommandBufferHandle>,
    pub(crate) extent: Option<Extent2d>,
    pub(crate) status: PipelineStatus,
    pub(crate) released: bool,
}

impl Pipeline {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn bind_point(&self) -> PipelineBindPoint {
        self.program.bind_point()
    }

    pub fn graphics_state(&self) -> &GraphicsState {
        &self.graphics_state
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames
    }

    /// Extent the native pipeline was last built for.
    pub fn extent(&self) -> Option<Extent2d> {
        self.extent
    }

    /// Native pipeline, once built by an update.
    pub fn native(&self) -> Option<PipelineHandle> {
        self.native
    }

    pub fn set_layout(&self) -> DescriptorSetLayoutHandle {
        self.set_layout
    }

    pub fn pipeline_layout(&self) -> PipelineLayoutHandle {
        self.pipeline_layout
    }

    pub fn descriptor_pool(&self) -> DescriptorPoolHandle {
        self.descriptor_pool
    }

    /// One descriptor set per in-flight frame.
    pub fn descriptor_sets(&self) -> &[DescriptorSetHandle] {
        &self.descriptor_sets
    }

    pub fn command_buffers(&self) -> &[CommandBufferHandle] {
        &self.command_buffers
    }

    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constants
    }

    /// Buffer holding one packed uniform region per in-flight frame.
    pub fn uniform_buffer(&self) -> Option<BufferHandle> {
        self.uniform_buffer
    }

    /// Size of one frame region of the uniform buffer.
    pub fn uniform_region_size(&self) -> u64 {
        self.region_size
    }

    /// Uniform blocks packed into the uniform buffer.
    pub fn packed_blocks(&self) -> &[PackedBlockInfo] {
        &self.packed_blocks
    }

    pub fn vertex_bindings(&self) -> &[VertexBindingDesc] {
        &self.vertex_bindings
    }

    pub fn vertex_attributes(&self) -> &[VertexAttributeDesc] {
        &self.vertex_attributes
    }

    /// Number of uniforms resolved into the uniform region.
    pub fn uniform_count(&self) -> usize {
        self.uniforms.len()
    }

    /// Number of textures resolved to a slot.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Free every backend object and drop the references on shared resources.
    ///
    /// Waits for the device to go idle first if a native pipeline exists.
    /// Calling it twice is a no-op.
    pub fn release(&mut self, backend: &dyn BindingBackend) {
        if self.released {
            return;
        }
        if self.native.is_some() {
            if let Err(err) = backend.wait_idle() {
                log::warn!("{}: wait idle failed during release: {err}", self.label);
            }
        }
        self.destroy_native(backend);

        for pair in &self.blocks {
            pair.block.release(backend);
        }
        for buffer in &self.vertex_buffers {
            buffer.release(backend);
        }
        if let Some(buffer) = self.uniform_buffer.take() {
            backend.destroy_buffer(buffer);
        }
        backend.destroy_pipeline_layout(self.pipeline_layout);
        backend.destroy_descriptor_pool(self.descriptor_pool);
        backend.destroy_descriptor_set_layout(self.set_layout);
        self.descriptor_sets.clear();

        self.extent = None;
        self.status = PipelineStatus::Unbound;
        self.released = true;
        log::debug!("{}: released", self.label);
    }

    /// Free the command buffers and destroy the native pipeline.
    pub(crate) fn destroy_native(&mut self, backend: &dyn BindingBackend) {
        if !self.command_buffers.is_empty() {
            backend.free_command_buffers(&self.command_buffers);
            self.command_buffers.clear();
        }
        if let Some(native) = self.native.take() {
            backend.destroy_pipeline(native);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!(
            "Pipeline {} dropped without release(). Backend objects may have leaked.",
            self.label
        );
    }
}
