//! Vulkan binding backend using ash.
//!
//! The backend does not own the device. Instance and device creation,
//! swapchain, render pass and submission stay with the host renderer; this
//! backend creates and tracks the objects the binding layer needs on top of
//! them:
//!
//! - host-visible buffers allocated through gpu-allocator
//! - descriptor set layouts, pools and sets
//! - pipeline layouts and pipelines built from [`GraphicsState`](crate::state::GraphicsState)
//! - secondary command buffers recorded inside the host render pass
//!
//! Images, samplers and shader modules are created by the host and imported
//! as handles.
//!
//! # Example
//!
//! ```ignore
//! let backend = VulkanBindingBackend::new(device.clone(), allocator.clone(), render_pass, command_pool);
//! let shader = backend.import_shader_module(vertex_module);
//! // build pipelines, update, bind_frame...
//! backend.end_commands(cmd)?;
//! let secondary = backend.command_buffer(cmd);
//! ```

mod conversion;

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use parking_lot::Mutex;

use crate::reflection::ShaderStageFlags;

use super::{
    BackendError, BindingBackend, BufferDescriptor, BufferHandle, CommandBufferHandle,
    ComputePipelineDescriptor, DescriptorLayoutEntry, DescriptorPoolHandle, DescriptorPoolSize,
    DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite, GraphicsPipelineDescriptor,
    ImageHandle, PipelineBindPoint, PipelineHandle, PipelineLayoutHandle, PushConstantRange,
    SamplerHandle, ShaderModuleHandle,
};

use conversion::{
    convert_bind_point, convert_blend_state, convert_buffer_usage, convert_compare_function,
    convert_cull_mode, convert_descriptor_kind, convert_input_rate, convert_shader_stage_flags,
    convert_stencil_state, convert_topology, convert_vertex_format, descriptor_image_layout,
};

const ENTRY_POINT: &std::ffi::CStr = c"main";

fn vk_error(what: &str, err: vk::Result) -> BackendError {
    match err {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY
        | vk::Result::ERROR_FRAGMENTED_POOL => BackendError::OutOfMemory,
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        other => BackendError::ResourceCreationFailed(format!("Failed to {what}: {other:?}")),
    }
}

struct VulkanBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

struct VulkanPipeline {
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

#[derive(Default)]
struct VulkanObjects {
    next_id: u64,
    buffers: HashMap<u64, VulkanBuffer>,
    set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    pools: HashMap<u64, vk::DescriptorPool>,
    sets: HashMap<u64, (u64, vk::DescriptorSet)>,
    pipeline_layouts: HashMap<u64, vk::PipelineLayout>,
    pipelines: HashMap<u64, VulkanPipeline>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
    images: HashMap<u64, vk::ImageView>,
    samplers: HashMap<u64, vk::Sampler>,
    shader_modules: HashMap<u64, vk::ShaderModule>,
}

impl VulkanObjects {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, handle: BufferHandle) -> Result<vk::Buffer, BackendError> {
        self.buffers
            .get(&handle.0)
            .map(|buffer| buffer.buffer)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", handle.0)))
    }

    fn set_layout(&self, handle: DescriptorSetLayoutHandle) -> Result<vk::DescriptorSetLayout, BackendError> {
        self.set_layouts
            .get(&handle.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor set layout {}", handle.0)))
    }

    fn pipeline_layout(&self, handle: PipelineLayoutHandle) -> Result<vk::PipelineLayout, BackendError> {
        self.pipeline_layouts
            .get(&handle.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("pipeline layout {}", handle.0)))
    }

    fn set(&self, handle: DescriptorSetHandle) -> Result<vk::DescriptorSet, BackendError> {
        self.sets
            .get(&handle.0)
            .map(|(_, set)| *set)
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor set {}", handle.0)))
    }

    fn shader_module(&self, handle: ShaderModuleHandle) -> Result<vk::ShaderModule, BackendError> {
        self.shader_modules
            .get(&handle.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("shader module {}", handle.0)))
    }

    fn cmd(&self, handle: CommandBufferHandle) -> Result<vk::CommandBuffer, BackendError> {
        self.command_buffers
            .get(&handle.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("command buffer {}", handle.0)))
    }
}

/// Vulkan implementation of [`BindingBackend`].
///
/// Objects created through the trait are destroyed through it. Whatever is
/// still alive is freed by [`destroy`](Self::destroy), which must run before
/// the device is destroyed.
pub struct VulkanBindingBackend {
    device: ash::Device,
    allocator: Arc<Mutex<Allocator>>,
    render_pass: vk::RenderPass,
    command_pool: vk::CommandPool,
    objects: Mutex<VulkanObjects>,
    destroyed: bool,
}

impl std::fmt::Debug for VulkanBindingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBindingBackend")
            .field("render_pass", &self.render_pass)
            .field("command_pool", &self.command_pool)
            .finish_non_exhaustive()
    }
}

impl VulkanBindingBackend {
    /// Wrap a host device.
    ///
    /// Graphics pipelines target subpass 0 of `render_pass`. Command buffers
    /// are allocated from `command_pool`, which must allow resetting individual
    /// command buffers.
    pub fn new(
        device: ash::Device,
        allocator: Arc<Mutex<Allocator>>,
        render_pass: vk::RenderPass,
        command_pool: vk::CommandPool,
    ) -> Self {
        Self {
            device,
            allocator,
            render_pass,
            command_pool,
            objects: Mutex::new(VulkanObjects::default()),
            destroyed: false,
        }
    }

    /// Register a host image view for texture bindings.
    pub fn import_image(&self, view: vk::ImageView) -> ImageHandle {
        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.images.insert(id, view);
        ImageHandle(id)
    }

    /// Register a host sampler.
    pub fn import_sampler(&self, sampler: vk::Sampler) -> SamplerHandle {
        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.samplers.insert(id, sampler);
        SamplerHandle(id)
    }

    /// Register a host shader module. The entry point must be `main`.
    pub fn import_shader_module(&self, module: vk::ShaderModule) -> ShaderModuleHandle {
        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.shader_modules.insert(id, module);
        ShaderModuleHandle(id)
    }

    /// Native command buffer behind `handle`, for execution in the host render pass.
    pub fn command_buffer(&self, handle: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        self.objects.lock().command_buffers.get(&handle.0).copied()
    }

    /// Finish recording `cmd`.
    pub fn end_commands(&self, cmd: CommandBufferHandle) -> Result<(), BackendError> {
        let cmd = self.objects.lock().cmd(cmd)?;
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| vk_error("end command buffer", e))
    }

    /// Free every object still alive.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - The GPU is idle (no pending operations using these resources)
    /// - This is called before the Vulkan device is destroyed
    pub unsafe fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let mut objects = self.objects.lock();

        let command_buffers: Vec<vk::CommandBuffer> =
            objects.command_buffers.drain().map(|(_, cmd)| cmd).collect();
        // SAFETY: Caller guarantees GPU is idle and device is valid
        unsafe {
            if !command_buffers.is_empty() {
                self.device
                    .free_command_buffers(self.command_pool, &command_buffers);
            }
            for (_, pipeline) in objects.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
            }
            for (_, layout) in objects.pipeline_layouts.drain() {
                self.device.destroy_pipeline_layout(layout, None);
            }
            objects.sets.clear();
            for (_, pool) in objects.pools.drain() {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, layout) in objects.set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }

        let mut allocator = self.allocator.lock();
        for (_, mut buffer) in objects.buffers.drain() {
            if let Some(allocation) = buffer.allocation.take() {
                let _ = allocator.free(allocation);
            }
            // SAFETY: Caller guarantees GPU is idle and device is valid
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        }

        self.destroyed = true;
    }
}

impl Drop for VulkanBindingBackend {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        log::warn!(
            "VulkanBindingBackend dropped without explicit destroy(). \
             Resources may have leaked. Always call destroy() before dropping the device."
        );
    }
}

impl BindingBackend for VulkanBindingBackend {
    fn name(&self) -> &'static str {
        "Vulkan Binding Backend (ash)"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, BackendError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size.max(1))
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| vk_error("create buffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        // Every binding buffer is written from the CPU through a mapping.
        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: descriptor.label.as_deref().unwrap_or("binding buffer"),
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { self.device.destroy_buffer(buffer, None) };
                BackendError::ResourceCreationFailed(format!("Failed to allocate buffer memory: {e}"))
            })?;

        if let Err(e) =
            unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            let _ = self.allocator.lock().free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(vk_error("bind buffer memory", e));
        }

        log::debug!(
            "Vulkan: created buffer {:?} ({} bytes, dynamic: {})",
            descriptor.label,
            descriptor.size,
            descriptor.dynamic
        );
        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.buffers.insert(
            id,
            VulkanBuffer {
                buffer,
                allocation: Some(allocation),
                size: descriptor.size,
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let objects = self.objects.lock();
        let target = objects
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        if offset + data.len() as u64 > target.size {
            return Err(BackendError::InvalidParameter(format!(
                "write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                target.size
            )));
        }
        let Some(allocation) = target.allocation.as_ref() else {
            return Err(BackendError::Internal("Buffer allocation is None".to_string()));
        };
        let Some(mapped_ptr) = allocation.mapped_ptr() else {
            return Err(BackendError::Internal(
                "Buffer is not mapped for CPU access".to_string(),
            ));
        };

        // SAFETY: the range was checked against the buffer size and the
        // mapping stays valid while the allocation is alive.
        unsafe {
            let dst = mapped_ptr.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let Some(mut removed) = self.objects.lock().buffers.remove(&buffer.0) else {
            return;
        };
        if let Some(allocation) = removed.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::error!("Vulkan: failed to free buffer memory: {e}");
            }
        }
        unsafe { self.device.destroy_buffer(removed.buffer, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        entries: &[DescriptorLayoutEntry],
    ) -> Result<DescriptorSetLayoutHandle, BackendError> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|entry| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.binding)
                    .descriptor_type(convert_descriptor_kind(entry.kind))
                    .descriptor_count(1)
                    .stage_flags(convert_shader_stage_flags(entry.stages))
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| vk_error("create descriptor set layout", e))?;

        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.set_layouts.insert(id, layout);
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        if let Some(layout) = self.objects.lock().set_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[DescriptorPoolSize],
    ) -> Result<DescriptorPoolHandle, BackendError> {
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|size| vk::DescriptorPoolSize {
                ty: convert_descriptor_kind(size.kind),
                descriptor_count: size.count,
            })
            .collect();
        // Vulkan rejects a pool without sizes, even for empty layouts.
        if pool_sizes.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            });
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets.max(1))
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| vk_error("create descriptor pool", e))?;

        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.pools.insert(id, pool);
        Ok(DescriptorPoolHandle(id))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut objects = self.objects.lock();
        objects.sets.retain(|_, (owner, _)| *owner != pool.0);
        if let Some(pool) = objects.pools.remove(&pool.0) {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>, BackendError> {
        let mut objects = self.objects.lock();
        let vk_pool = objects
            .pools
            .get(&pool.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor pool {}", pool.0)))?;
        let vk_layout = objects.set_layout(layout)?;

        let layouts = vec![vk_layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk_pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| vk_error("allocate descriptor sets", e))?;

        Ok(sets
            .into_iter()
            .map(|set| {
                let id = objects.next();
                objects.sets.insert(id, (pool.0, set));
                DescriptorSetHandle(id)
            })
            .collect())
    }

    fn update_descriptor_set(
        &self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> Result<(), BackendError> {
        let objects = self.objects.lock();
        let dst_set = objects.set(set)?;

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for write in writes {
            match write {
                DescriptorWrite::Buffer {
                    buffer,
                    offset,
                    range,
                    ..
                } => buffer_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(objects.buffer(*buffer)?)
                        .offset(*offset)
                        .range(*range),
                ),
                DescriptorWrite::Image {
                    kind,
                    image,
                    sampler,
                    ..
                } => {
                    let view = objects
                        .images
                        .get(&image.0)
                        .copied()
                        .ok_or_else(|| BackendError::InvalidHandle(format!("image {}", image.0)))?;
                    let sampler = match sampler {
                        Some(sampler) => objects.samplers.get(&sampler.0).copied().ok_or_else(
                            || BackendError::InvalidHandle(format!("sampler {}", sampler.0)),
                        )?,
                        None => vk::Sampler::null(),
                    };
                    image_infos.push(
                        vk::DescriptorImageInfo::default()
                            .image_view(view)
                            .sampler(sampler)
                            .image_layout(descriptor_image_layout(*kind)),
                    );
                }
            }
        }

        let mut vk_writes = Vec::with_capacity(writes.len());
        let (mut next_buffer, mut next_image) = (0, 0);
        for write in writes {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(dst_set)
                .dst_binding(write.binding());
            match write {
                DescriptorWrite::Buffer { kind, .. } => {
                    vk_writes.push(
                        base.descriptor_type(convert_descriptor_kind(*kind))
                            .buffer_info(std::slice::from_ref(&buffer_infos[next_buffer])),
                    );
                    next_buffer += 1;
                }
                DescriptorWrite::Image { kind, .. } => {
                    vk_writes.push(
                        base.descriptor_type(convert_descriptor_kind(*kind))
                            .image_info(std::slice::from_ref(&image_infos[next_image])),
                    );
                    next_image += 1;
                }
            }
        }

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        set_layout: DescriptorSetLayoutHandle,
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutHandle, BackendError> {
        let set_layouts = [self.objects.lock().set_layout(set_layout)?];
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|range| {
                vk::PushConstantRange::default()
                    .stage_flags(convert_shader_stage_flags(range.stages))
                    .offset(range.offset)
                    .size(range.size)
            })
            .collect();
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);

        let layout = unsafe { self.device.create_pipeline_layout(&create_info, None) }
            .map_err(|e| vk_error("create pipeline layout", e))?;

        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.pipeline_layouts.insert(id, layout);
        Ok(PipelineLayoutHandle(id))
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        if let Some(layout) = self.objects.lock().pipeline_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_pipeline_layout(layout, None) };
        }
    }

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> Result<PipelineHandle, BackendError> {
        let (layout, vertex_module, fragment_module) = {
            let objects = self.objects.lock();
            (
                objects.pipeline_layout(descriptor.layout)?,
                objects.shader_module(descriptor.vertex)?,
                objects.shader_module(descriptor.fragment)?,
            )
        };
        let state = &descriptor.state;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(ENTRY_POINT),
        ];

        let binding_descriptions: Vec<vk::VertexInputBindingDescription> = descriptor
            .vertex_bindings
            .iter()
            .map(|binding| {
                vk::VertexInputBindingDescription::default()
                    .binding(binding.binding)
                    .stride(binding.stride)
                    .input_rate(convert_input_rate(binding.input_rate))
            })
            .collect();
        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = descriptor
            .vertex_attributes
            .iter()
            .map(|attr| {
                vk::VertexInputAttributeDescription::default()
                    .location(attr.location)
                    .binding(attr.binding)
                    .format(convert_vertex_format(attr.format))
                    .offset(attr.offset)
            })
            .collect();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(convert_topology(state.topology))
            .primitive_restart_enable(false);

        // Viewport and scissor are baked in, so a new extent means a new pipeline.
        let extent = vk::Extent2D {
            width: descriptor.extent.width,
            height: descriptor.extent.height,
        };
        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(convert_cull_mode(state.cull_mode))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let stencil = convert_stencil_state(&state.stencil);
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth.test_enabled)
            .depth_write_enable(state.depth.write_enabled)
            .depth_compare_op(convert_compare_function(state.depth.compare))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(state.stencil.enabled)
            .front(stencil)
            .back(stencil);

        let color_blend_attachments = [convert_blend_state(&state.blend, state.color_write_mask)];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .layout(layout)
            .render_pass(self.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| vk_error("create graphics pipeline", e))?;
        let pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Internal("no graphics pipeline returned".to_string()))?;

        log::debug!(
            "Vulkan: created graphics pipeline {:?} for {}",
            descriptor.label,
            descriptor.extent
        );
        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.pipelines.insert(
            id,
            VulkanPipeline {
                pipeline,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> Result<PipelineHandle, BackendError> {
        let (layout, module) = {
            let objects = self.objects.lock();
            (
                objects.pipeline_layout(descriptor.layout)?,
                objects.shader_module(descriptor.module)?,
            )
        };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(ENTRY_POINT);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| vk_error("create compute pipeline", e))?;
        let pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Internal("no compute pipeline returned".to_string()))?;

        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.pipelines.insert(
            id,
            VulkanPipeline {
                pipeline,
                bind_point: vk::PipelineBindPoint::COMPUTE,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if let Some(pipeline) = self.objects.lock().pipelines.remove(&pipeline.0) {
            unsafe { self.device.destroy_pipeline(pipeline.pipeline, None) };
        }
    }

    fn allocate_command_buffers(
        &self,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>, BackendError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::SECONDARY)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_error("allocate command buffers", e))?;

        let mut objects = self.objects.lock();
        Ok(buffers
            .into_iter()
            .map(|cmd| {
                let id = objects.next();
                objects.command_buffers.insert(id, cmd);
                CommandBufferHandle(id)
            })
            .collect())
    }

    fn free_command_buffers(&self, buffers: &[CommandBufferHandle]) {
        let mut objects = self.objects.lock();
        let native: Vec<vk::CommandBuffer> = buffers
            .iter()
            .filter_map(|handle| objects.command_buffers.remove(&handle.0))
            .collect();
        if !native.is_empty() {
            unsafe { self.device.free_command_buffers(self.command_pool, &native) };
        }
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| vk_error("wait for device idle", e))
    }

    fn begin_commands(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
    ) -> Result<(), BackendError> {
        let cmd = self.objects.lock().cmd(cmd)?;

        let inheritance = match bind_point {
            PipelineBindPoint::Graphics => vk::CommandBufferInheritanceInfo::default()
                .render_pass(self.render_pass)
                .subpass(0),
            PipelineBindPoint::Compute => vk::CommandBufferInheritanceInfo::default(),
        };
        let flags = match bind_point {
            PipelineBindPoint::Graphics => vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            PipelineBindPoint::Compute => vk::CommandBufferUsageFlags::empty(),
        };
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(flags)
            .inheritance_info(&inheritance);

        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| vk_error("begin command buffer", e))
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) -> Result<(), BackendError> {
        let objects = self.objects.lock();
        let cmd = objects.cmd(cmd)?;
        let pipeline = objects
            .pipelines
            .get(&pipeline.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("pipeline {}", pipeline.0)))?;
        let bind_point = convert_bind_point(bind_point);
        if pipeline.bind_point != bind_point {
            return Err(BackendError::InvalidParameter(format!(
                "pipeline created for {:?} bound at {bind_point:?}",
                pipeline.bind_point
            )));
        }
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline.pipeline) };
        Ok(())
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: CommandBufferHandle,
        first_binding: u32,
        buffers: &[BufferHandle],
        offsets: &[u64],
    ) -> Result<(), BackendError> {
        if buffers.len() != offsets.len() {
            return Err(BackendError::InvalidParameter(format!(
                "{} vertex buffers with {} offsets",
                buffers.len(),
                offsets.len()
            )));
        }
        let objects = self.objects.lock();
        let cmd = objects.cmd(cmd)?;
        let native = buffers
            .iter()
            .map(|buffer| objects.buffer(*buffer))
            .collect::<Result<Vec<_>, _>>()?;
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, first_binding, &native, offsets)
        };
        Ok(())
    }

    fn cmd_push_constants(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let objects = self.objects.lock();
        let cmd = objects.cmd(cmd)?;
        let layout = objects.pipeline_layout(layout)?;
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                layout,
                convert_shader_stage_flags(stages),
                offset,
                data,
            )
        };
        Ok(())
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    ) -> Result<(), BackendError> {
        let objects = self.objects.lock();
        let cmd = objects.cmd(cmd)?;
        let layout = objects.pipeline_layout(layout)?;
        let set = objects.set(set)?;
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                convert_bind_point(bind_point),
                layout,
                0,
                &[set],
                &[],
            )
        };
        Ok(())
    }
}

static_assertions::assert_impl_all!(VulkanBindingBackend: Send, Sync);
