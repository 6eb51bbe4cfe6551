//! Build-time binding resolution.
//!
//! Every name lookup happens here. The merged [`InterfaceMap`] is walked once
//! and the result is stored on the [`Pipeline`] as plain vectors of resolved
//! pairs, so the per-frame path never touches a string.

use bindery_core::{FieldInfo, PackingStandard, compute_layout};

use crate::backend::{
    BindingBackend, BufferDescriptor, BufferHandle, BufferUsage, DescriptorKind,
    DescriptorLayoutEntry, DescriptorPoolHandle, DescriptorPoolSize, DescriptorSetLayoutHandle,
    DescriptorWrite, PipelineLayoutHandle, PushConstantRange, VertexAttributeDesc, VertexBindingDesc,
    VertexFormat, VertexInputRate,
};
use crate::context::BindingContext;
use crate::error::BindingError;
use crate::reflection::{BindingKind, InterfaceMap, ShaderStageFlags, SlotEntry};
use crate::resources::{SharedBlock, SharedBuffer};

use super::{
    BlockPair, PackedBlockInfo, Pipeline, PipelineDescriptor, PipelineStatus, RESERVED_ATTRIBUTES,
    ShaderProgram, TexturePair, UniformPair,
};

/// Projection plus modelview, the most the transform push can carry.
const TRANSFORM_PUSH_SIZE: u32 = 128;

const DESCRIPTOR_KINDS: [DescriptorKind; 4] = [
    DescriptorKind::UniformBuffer,
    DescriptorKind::StorageBuffer,
    DescriptorKind::CombinedImageSampler,
    DescriptorKind::StorageImage,
];

/// A uniform block packed into the pipeline uniform buffer.
struct PackedSlot<'a> {
    entry: &'a SlotEntry,
    offset: u64,
}

/// Locate a packed block member by name, as an offset into a frame region.
fn locate(packed: &[PackedSlot<'_>], name: &str) -> Option<(u64, u64, u32)> {
    packed.iter().find_map(|slot| {
        slot.entry
            .variable(name)
            .map(|variable| (slot.offset, u64::from(slot.entry.size), variable.offset))
    })
}

/// Check descriptor and push-constant counts against the device limits.
fn check_limits(map: &InterfaceMap, ctx: &BindingContext) -> Result<(), BindingError> {
    let caps = ctx.caps();
    let limits = [
        (DescriptorKind::UniformBuffer, "uniform buffers", caps.max_uniform_buffers),
        (DescriptorKind::StorageBuffer, "storage buffers", caps.max_storage_buffers),
        (DescriptorKind::CombinedImageSampler, "sampled images", caps.max_sampled_images),
        (DescriptorKind::StorageImage, "storage images", caps.max_storage_images),
    ];
    for (kind, resource, limit) in limits {
        let required = map.descriptor_count(kind);
        if required > limit {
            return Err(BindingError::ResourceLimit {
                resource,
                required,
                limit,
            });
        }
    }

    let push_size = map.push_constant_size();
    if push_size > caps.max_push_constants_size {
        return Err(BindingError::ResourceLimit {
            resource: "push constant bytes",
            required: push_size,
            limit: caps.max_push_constants_size,
        });
    }
    Ok(())
}

/// Vertex inputs resolved for one input rate.
#[derive(Default)]
struct VertexLayout {
    buffers: Vec<SharedBuffer>,
    bindings: Vec<VertexBindingDesc>,
    attributes: Vec<VertexAttributeDesc>,
}

impl VertexLayout {
    fn add(
        &mut self,
        map: &InterfaceMap,
        label: &str,
        attributes: &[(String, SharedBuffer)],
        input_rate: VertexInputRate,
    ) -> Result<(), BindingError> {
        for (name, buffer) in attributes {
            let Some(input) = map.vertex_inputs().iter().find(|input| &input.name == name) else {
                log::debug!("{label}: attribute {name} is not used by the program");
                continue;
            };
            let data_type = buffer.data_type();
            let format = VertexFormat::from_data_type(data_type).ok_or_else(|| {
                BindingError::Format {
                    attribute: name.clone(),
                    data_type,
                }
            })?;

            let binding = self.bindings.len() as u32;
            self.bindings.push(VertexBindingDesc {
                binding,
                stride: buffer.field_info().stride,
                input_rate,
            });
            self.attributes.push(VertexAttributeDesc {
                location: input.location,
                binding,
                format,
                offset: 0,
            });
            self.buffers.push(buffer.clone());
        }
        Ok(())
    }
}

/// Backend objects created during a build, freed if the build fails.
struct BuildGuard<'a> {
    backend: &'a dyn BindingBackend,
    set_layout: Option<DescriptorSetLayoutHandle>,
    pool: Option<DescriptorPoolHandle>,
    pipeline_layout: Option<PipelineLayoutHandle>,
    uniform_buffer: Option<BufferHandle>,
    blocks: Vec<SharedBlock>,
    buffers: Vec<SharedBuffer>,
}

impl<'a> BuildGuard<'a> {
    fn new(backend: &'a dyn BindingBackend) -> Self {
        Self {
            backend,
            set_layout: None,
            pool: None,
            pipeline_layout: None,
            uniform_buffer: None,
            blocks: Vec::new(),
            buffers: Vec::new(),
        }
    }

    fn disarm(mut self) {
        self.set_layout = None;
        self.pool = None;
        self.pipeline_layout = None;
        self.uniform_buffer = None;
        self.blocks.clear();
        self.buffers.clear();
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        for block in &self.blocks {
            block.release(self.backend);
        }
        for buffer in &self.buffers {
            buffer.release(self.backend);
        }
        if let Some(buffer) = self.uniform_buffer {
            self.backend.destroy_buffer(buffer);
        }
        if let Some(layout) = self.pipeline_layout {
            self.backend.destroy_pipeline_layout(layout);
        }
        if let Some(pool) = self.pool {
            self.backend.destroy_descriptor_pool(pool);
        }
        if let Some(layout) = self.set_layout {
            self.backend.destroy_descriptor_set_layout(layout);
        }
    }
}

impl Pipeline {
    /// Resolve `descriptor` against the program's reflection and create the
    /// descriptor objects.
    ///
    /// The native pipeline itself is created by the first
    /// [`update`](Self::update), once the target extent is known.
    ///
    /// # Errors
    ///
    /// - [`BindingError::MissingStage`] if a stage reflection does not match the program kind
    /// - [`BindingError::BindingConflict`] if stages disagree on a slot's kind
    /// - [`BindingError::ResourceLimit`] if the program needs more than the device offers
    /// - [`BindingError::Format`] if an attribute type has no vertex format
    /// - [`BindingError::Backend`] if creating a backend object fails
    pub fn build(
        backend: &dyn BindingBackend,
        ctx: &BindingContext,
        descriptor: PipelineDescriptor,
    ) -> Result<Self, BindingError> {
        let PipelineDescriptor {
            label,
            program,
            resources,
            state,
        } = descriptor;
        let label = label.unwrap_or_else(|| "pipeline".to_string());
        let frames = ctx.frames_in_flight();
        let caps = ctx.caps();

        let map = InterfaceMap::merge(&program.reflections()?)?;
        check_limits(&map, ctx)?;

        // Uniform and storage blocks
        let alignment = caps.min_uniform_buffer_offset_alignment.max(1);
        let mut packed = Vec::new();
        let mut block_slots = Vec::new();
        let mut region = 0u64;
        for entry in map.slots() {
            if !matches!(entry.kind, BindingKind::UniformBlock | BindingKind::StorageBlock) {
                continue;
            }
            if let Some((_, block)) = resources.blocks.iter().find(|(name, _)| *name == entry.name) {
                block_slots.push((entry, block.clone()));
                continue;
            }
            if entry.kind == BindingKind::StorageBlock {
                log::warn!("{label}: storage block {} has no matching block", entry.name);
                continue;
            }
            let offset = region.next_multiple_of(alignment);
            packed.push(PackedSlot { entry, offset });
            region = offset + u64::from(entry.size);
        }
        let region_size = region.next_multiple_of(alignment);

        for (name, _) in &resources.blocks {
            if !block_slots.iter().any(|(entry, _)| entry.name == *name) {
                log::debug!("{label}: block {name} is not used by the program");
            }
        }

        // Uniforms
        let mut uniforms = Vec::new();
        for (name, source) in &resources.uniforms {
            let Some((block_offset, block_size, variable_offset)) = locate(&packed, name) else {
                log::debug!("{label}: uniform {name} is not used by the program");
                continue;
            };
            let decl = source.read().decl();
            let layout = compute_layout(&[decl], PackingStandard::Std140);
            let Some(field) = layout.field(0) else {
                continue;
            };
            if u64::from(variable_offset) + u64::from(field.size) > block_size {
                log::warn!("{label}: uniform {name} does not fit its block, skipped");
                continue;
            }
            uniforms.push(UniformPair {
                source: source.clone(),
                info: FieldInfo {
                    offset: (block_offset + u64::from(variable_offset)) as u32,
                    size: field.size,
                    stride: field.stride,
                },
            });
        }

        // Textures
        let companion = |name: &str| {
            locate(&packed, name).map(|(block_offset, _, offset)| (block_offset as u32) + offset)
        };
        let mut textures = Vec::new();
        for (name, texture) in &resources.textures {
            let Some(entry) = map.find(&format!("{name}_sampler")) else {
                log::debug!("{label}: texture {name} is not used by the program");
                continue;
            };
            let kind = match entry.kind {
                BindingKind::SampledImage => DescriptorKind::CombinedImageSampler,
                BindingKind::StorageImage => DescriptorKind::StorageImage,
                other => {
                    log::warn!("{label}: {name}_sampler is a {other}, texture skipped");
                    continue;
                }
            };
            textures.push(TexturePair {
                texture: texture.clone(),
                binding: entry.slot,
                kind,
                coord_matrix: companion(&format!("{name}_coord_matrix")),
                dimensions: companion(&format!("{name}_dimensions")),
                timestamp: companion(&format!("{name}_ts")),
            });
        }

        // Vertex and instance attributes
        let mut vertex = VertexLayout::default();
        match &program {
            ShaderProgram::Graphics { .. } => {
                vertex.add(&map, &label, &resources.attributes, VertexInputRate::Vertex)?;
                vertex.add(
                    &map,
                    &label,
                    &resources.instance_attributes,
                    VertexInputRate::Instance,
                )?;
                if vertex.bindings.len() as u32 > caps.max_vertex_input_bindings {
                    return Err(BindingError::ResourceLimit {
                        resource: "vertex input bindings",
                        required: vertex.bindings.len() as u32,
                        limit: caps.max_vertex_input_bindings,
                    });
                }
                for reserved in RESERVED_ATTRIBUTES {
                    let declared = map.vertex_inputs().iter().any(|input| input.name == reserved);
                    let provided = resources
                        .attributes
                        .iter()
                        .chain(&resources.instance_attributes)
                        .any(|(name, _)| name == reserved);
                    if declared && !provided {
                        log::warn!("{label}: vertex attribute {reserved} is not provided");
                    }
                }
            }
            ShaderProgram::Compute(_) => {
                if !resources.attributes.is_empty() || !resources.instance_attributes.is_empty() {
                    log::debug!("{label}: compute program ignores vertex attributes");
                }
            }
        }

        let push_constants: Vec<PushConstantRange> = map
            .push_constants()
            .iter()
            .map(|block| PushConstantRange {
                stages: block.stages,
                offset: block.offset,
                size: block.size,
            })
            .collect();
        // Transforms go through the block at offset 0 only; pushing with any
        // other stage would fall outside that stage's range.
        let (transform_stages, transform_size) = map
            .push_constants()
            .first()
            .map_or((ShaderStageFlags::empty(), 0), |block| {
                (block.stages, block.size.min(TRANSFORM_PUSH_SIZE))
            });

        // Backend objects
        let mut guard = BuildGuard::new(backend);

        let entries: Vec<DescriptorLayoutEntry> = map
            .slots()
            .filter_map(|entry| {
                entry.kind.descriptor_kind().map(|kind| DescriptorLayoutEntry {
                    binding: entry.slot,
                    kind,
                    stages: entry.stages,
                })
            })
            .collect();
        let set_layout = backend.create_descriptor_set_layout(&entries)?;
        guard.set_layout = Some(set_layout);

        let sizes: Vec<DescriptorPoolSize> = DESCRIPTOR_KINDS
            .into_iter()
            .map(|kind| DescriptorPoolSize {
                kind,
                count: map.descriptor_count(kind) * frames,
            })
            .filter(|size| size.count > 0)
            .collect();
        let descriptor_pool = backend.create_descriptor_pool(frames, &sizes)?;
        guard.pool = Some(descriptor_pool);

        let descriptor_sets = backend.allocate_descriptor_sets(descriptor_pool, set_layout, frames)?;
        let pipeline_layout = backend.create_pipeline_layout(set_layout, &push_constants)?;
        guard.pipeline_layout = Some(pipeline_layout);

        let uniform_buffer = if region_size > 0 {
            let descriptor = BufferDescriptor::new(region_size * u64::from(frames), BufferUsage::UNIFORM)
                .with_label(format!("{label} uniforms"))
                .with_dynamic(true);
            let buffer = backend.create_buffer(&descriptor)?;
            guard.uniform_buffer = Some(buffer);
            Some(buffer)
        } else {
            None
        };

        let mut blocks = Vec::with_capacity(block_slots.len());
        for (entry, block) in block_slots {
            block.acquire(backend)?;
            guard.blocks.push(block.clone());
            if let Some(kind) = entry.kind.descriptor_kind() {
                blocks.push(BlockPair {
                    block,
                    binding: entry.slot,
                    kind,
                });
            }
        }
        for buffer in &vertex.buffers {
            buffer.acquire(backend)?;
            guard.buffers.push(buffer.clone());
        }

        let packed_blocks: Vec<PackedBlockInfo> = packed
            .iter()
            .map(|slot| PackedBlockInfo {
                binding: slot.entry.slot,
                offset: slot.offset,
                size: u64::from(slot.entry.size),
            })
            .collect();

        for (index, set) in descriptor_sets.iter().enumerate() {
            let mut writes = Vec::with_capacity(packed_blocks.len() + blocks.len());
            if let Some(buffer) = uniform_buffer {
                let base = index as u64 * region_size;
                writes.extend(packed_blocks.iter().map(|info| DescriptorWrite::Buffer {
                    binding: info.binding,
                    kind: DescriptorKind::UniformBuffer,
                    buffer,
                    offset: base + info.offset,
                    range: info.size,
                }));
            }
            for pair in &blocks {
                let Some(buffer) = pair.block.buffer() else {
                    continue;
                };
                writes.push(DescriptorWrite::Buffer {
                    binding: pair.binding,
                    kind: pair.kind,
                    buffer,
                    offset: 0,
                    range: u64::from(pair.block.size().max(1)),
                });
            }
            if !writes.is_empty() {
                backend.update_descriptor_set(*set, &writes)?;
            }
        }

        guard.disarm();
        log::debug!(
            "{label}: built with {} slots, {} uniforms, {} textures, {} vertex bindings, {} bytes per frame",
            entries.len(),
            uniforms.len(),
            textures.len(),
            vertex.bindings.len(),
            region_size
        );

        Ok(Self {
            label,
            program,
            graphics_state: state,
            frames,
            set_layout,
            pipeline_layout,
            descriptor_pool,
            descriptor_sets,
            push_constants,
            transform_stages,
            transform_size,
            uniform_buffer,
            region_size,
            staging: vec![0; region_size as usize],
            region_stamps: vec![None; frames as usize],
            packed_blocks,
            uniforms,
            textures,
            blocks,
            vertex_buffers: vertex.buffers,
            vertex_bindings: vertex.bindings,
            vertex_attributes: vertex.attributes,
            native: None,
            command_buffers: Vec::new(),
            extent: None,
            status: PipelineStatus::Unbound,
            released: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{InterfaceBinding, ShaderStage, StageReflection};

    #[test]
    fn test_locate_adds_block_offset() {
        let map = InterfaceMap::merge(&[StageReflection::new(ShaderStage::Fragment)
            .with_binding(InterfaceBinding::uniform_block("a", 0, 16).with_variable("x", 0))
            .with_binding(InterfaceBinding::uniform_block("b", 1, 32).with_variable("y", 16))])
        .unwrap();
        let packed: Vec<PackedSlot<'_>> = map
            .slots()
            .zip([0u64, 256])
            .map(|(entry, offset)| PackedSlot { entry, offset })
            .collect();

        assert_eq!(locate(&packed, "y"), Some((256, 32, 16)));
        assert_eq!(locate(&packed, "x"), Some((0, 16, 0)));
        assert_eq!(locate(&packed, "z"), None);
    }

    #[test]
    fn test_push_constant_limit() {
        let map = InterfaceMap::merge(&[StageReflection::new(ShaderStage::Vertex)
            .with_binding(InterfaceBinding::push_constants("transforms", 128))
            .with_binding(InterfaceBinding::push_constants("extra", 64))])
        .unwrap();
        let err = check_limits(&map, &BindingContext::default()).unwrap_err();
        assert!(matches!(
            err,
            BindingError::ResourceLimit {
                resource: "push constant bytes",
                required: 192,
                limit: 128
            }
        ));
    }
}
