//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. It keeps a table of the
//! objects it handed out, stores buffer contents in memory and records every
//! command, so tests can read back uploads and check the order of binds.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use crate::reflection::ShaderStageFlags;

use super::{
    BackendError, BindingBackend, BufferDescriptor, BufferHandle, CommandBufferHandle,
    ComputePipelineDescriptor, DescriptorLayoutEntry, DescriptorPoolHandle, DescriptorPoolSize,
    DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite, GraphicsPipelineDescriptor,
    ImageHandle, PipelineBindPoint, PipelineHandle, PipelineLayoutHandle, PushConstantRange,
    SamplerHandle, ShaderModuleHandle,
};

/// A command recorded into a command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    Begin {
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
    },
    BindPipeline {
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    },
    BindVertexBuffers {
        cmd: CommandBufferHandle,
        first_binding: u32,
        buffers: Vec<BufferHandle>,
        offsets: Vec<u64>,
    },
    PushConstants {
        cmd: CommandBufferHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    BindDescriptorSet {
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        set: DescriptorSetHandle,
    },
}

/// Running counters of device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DummyStats {
    pub buffers_created: u32,
    pub buffers_destroyed: u32,
    pub buffer_writes: u32,
    pub pipelines_created: u32,
    pub pipelines_destroyed: u32,
    pub command_buffers_allocated: u32,
    pub command_buffers_freed: u32,
    pub descriptor_writes: u32,
    pub wait_idle_calls: u32,
}

/// A native pipeline as it was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedPipeline {
    Graphics(GraphicsPipelineDescriptor),
    Compute(ComputePipelineDescriptor),
}

#[derive(Debug, Default)]
struct DummyState {
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    set_layouts: HashMap<u64, Vec<DescriptorLayoutEntry>>,
    pools: HashMap<u64, (u32, Vec<DescriptorPoolSize>)>,
    sets: HashMap<u64, (u64, BTreeMap<u32, DescriptorWrite>)>,
    pipeline_layouts: HashMap<u64, Vec<PushConstantRange>>,
    pipelines: HashMap<u64, RecordedPipeline>,
    command_buffers: HashSet<u64>,
    commands: Vec<RecordedCommand>,
    stats: DummyStats,
}

impl DummyState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_cmd(&self, cmd: CommandBufferHandle) -> Result<(), BackendError> {
        if self.command_buffers.contains(&cmd.0) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle(format!("command buffer {}", cmd.0)))
        }
    }
}

/// Dummy GPU backend.
#[derive(Debug, Default)]
pub struct DummyBackend {
    state: Mutex<DummyState>,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an externally created image.
    pub fn import_image(&self) -> ImageHandle {
        ImageHandle(self.state.lock().next())
    }

    /// Register an externally created sampler.
    pub fn import_sampler(&self) -> SamplerHandle {
        SamplerHandle(self.state.lock().next())
    }

    /// Register an externally compiled shader module.
    pub fn import_shader_module(&self) -> ShaderModuleHandle {
        ShaderModuleHandle(self.state.lock().next())
    }

    /// Counters since creation.
    pub fn stats(&self) -> DummyStats {
        self.state.lock().stats
    }

    /// Recorded commands, oldest first.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.clone()
    }

    /// Forget recorded commands.
    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Current contents of `buffer`.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.0).cloned()
    }

    /// Number of buffers currently alive.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of native pipelines currently alive.
    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    /// Entries of a descriptor set layout.
    pub fn set_layout_entries(
        &self,
        layout: DescriptorSetLayoutHandle,
    ) -> Option<Vec<DescriptorLayoutEntry>> {
        self.state.lock().set_layouts.get(&layout.0).cloned()
    }

    /// `max_sets` and sizes of a descriptor pool.
    pub fn pool_sizes(&self, pool: DescriptorPoolHandle) -> Option<(u32, Vec<DescriptorPoolSize>)> {
        self.state.lock().pools.get(&pool.0).cloned()
    }

    /// Latest write of every slot of `set`, ordered by slot.
    pub fn descriptor_writes(&self, set: DescriptorSetHandle) -> Vec<DescriptorWrite> {
        self.state
            .lock()
            .sets
            .get(&set.0)
            .map(|(_, writes)| writes.values().copied().collect())
            .unwrap_or_default()
    }

    /// Push-constant ranges of a pipeline layout.
    pub fn push_constant_ranges(&self, layout: PipelineLayoutHandle) -> Option<Vec<PushConstantRange>> {
        self.state.lock().pipeline_layouts.get(&layout.0).cloned()
    }

    /// Descriptor of a live native pipeline.
    pub fn pipeline(&self, pipeline: PipelineHandle) -> Option<RecordedPipeline> {
        self.state.lock().pipelines.get(&pipeline.0).cloned()
    }
}

impl BindingBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, BackendError> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        let mut state = self.state.lock();
        let id = state.next();
        state.buffers.insert(id, vec![0; descriptor.size as usize]);
        state.stats.buffers_created += 1;
        Ok(BufferHandle(id))
    }

    fn write_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        log::trace!(
            "DummyBackend: writing {} bytes to buffer {} at {offset}",
            data.len(),
            buffer.0
        );
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(BackendError::InvalidParameter(format!(
                "write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        state.stats.buffer_writes += 1;
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        log::trace!("DummyBackend: destroying buffer {}", buffer.0);
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer.0).is_some() {
            state.stats.buffers_destroyed += 1;
        }
    }

    fn create_descriptor_set_layout(
        &self,
        entries: &[DescriptorLayoutEntry],
    ) -> Result<DescriptorSetLayoutHandle, BackendError> {
        log::trace!(
            "DummyBackend: creating descriptor set layout with {} entries",
            entries.len()
        );
        let mut state = self.state.lock();
        let id = state.next();
        state.set_layouts.insert(id, entries.to_vec());
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        self.state.lock().set_layouts.remove(&layout.0);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[DescriptorPoolSize],
    ) -> Result<DescriptorPoolHandle, BackendError> {
        log::trace!("DummyBackend: creating descriptor pool (max sets: {max_sets})");
        let mut state = self.state.lock();
        let id = state.next();
        state.pools.insert(id, (max_sets, sizes.to_vec()));
        Ok(DescriptorPoolHandle(id))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state.lock();
        state.pools.remove(&pool.0);
        state.sets.retain(|_, (owner, _)| *owner != pool.0);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>, BackendError> {
        let mut state = self.state.lock();
        let max_sets = state
            .pools
            .get(&pool.0)
            .map(|(max_sets, _)| *max_sets)
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor pool {}", pool.0)))?;
        if !state.set_layouts.contains_key(&layout.0) {
            return Err(BackendError::InvalidHandle(format!(
                "descriptor set layout {}",
                layout.0
            )));
        }
        let allocated = state.sets.values().filter(|(owner, _)| *owner == pool.0).count();
        if allocated + count as usize > max_sets as usize {
            return Err(BackendError::OutOfMemory);
        }

        let mut sets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = state.next();
            state.sets.insert(id, (pool.0, BTreeMap::new()));
            sets.push(DescriptorSetHandle(id));
        }
        log::trace!("DummyBackend: allocated {count} descriptor sets");
        Ok(sets)
    }

    fn update_descriptor_set(
        &self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let (_, slots) = state
            .sets
            .get_mut(&set.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor set {}", set.0)))?;
        for write in writes {
            slots.insert(write.binding(), *write);
        }
        state.stats.descriptor_writes += writes.len() as u32;
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        set_layout: DescriptorSetLayoutHandle,
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutHandle, BackendError> {
        let mut state = self.state.lock();
        if !state.set_layouts.contains_key(&set_layout.0) {
            return Err(BackendError::InvalidHandle(format!(
                "descriptor set layout {}",
                set_layout.0
            )));
        }
        let id = state.next();
        state.pipeline_layouts.insert(id, push_constants.to_vec());
        Ok(PipelineLayoutHandle(id))
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        self.state.lock().pipeline_layouts.remove(&layout.0);
    }

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> Result<PipelineHandle, BackendError> {
        log::trace!(
            "DummyBackend: creating graphics pipeline {:?} ({})",
            descriptor.label,
            descriptor.extent
        );
        let mut state = self.state.lock();
        let id = state.next();
        state
            .pipelines
            .insert(id, RecordedPipeline::Graphics(descriptor.clone()));
        state.stats.pipelines_created += 1;
        Ok(PipelineHandle(id))
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> Result<PipelineHandle, BackendError> {
        log::trace!(
            "DummyBackend: creating compute pipeline {:?}",
            descriptor.label
        );
        let mut state = self.state.lock();
        let id = state.next();
        state
            .pipelines
            .insert(id, RecordedPipeline::Compute(descriptor.clone()));
        state.stats.pipelines_created += 1;
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        log::trace!("DummyBackend: destroying pipeline {}", pipeline.0);
        let mut state = self.state.lock();
        if state.pipelines.remove(&pipeline.0).is_some() {
            state.stats.pipelines_destroyed += 1;
        }
    }

    fn allocate_command_buffers(
        &self,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>, BackendError> {
        let mut state = self.state.lock();
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = state.next();
            state.command_buffers.insert(id);
            buffers.push(CommandBufferHandle(id));
        }
        state.stats.command_buffers_allocated += count;
        Ok(buffers)
    }

    fn free_command_buffers(&self, buffers: &[CommandBufferHandle]) {
        let mut state = self.state.lock();
        for buffer in buffers {
            if state.command_buffers.remove(&buffer.0) {
                state.stats.command_buffers_freed += 1;
            }
        }
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        log::trace!("DummyBackend: wait idle");
        self.state.lock().stats.wait_idle_calls += 1;
        Ok(())
    }

    fn begin_commands(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_cmd(cmd)?;
        state.commands.push(RecordedCommand::Begin { cmd, bind_point });
        Ok(())
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_cmd(cmd)?;
        if !state.pipelines.contains_key(&pipeline.0) {
            return Err(BackendError::InvalidHandle(format!("pipeline {}", pipeline.0)));
        }
        state.commands.push(RecordedCommand::BindPipeline {
            cmd,
            bind_point,
            pipeline,
        });
        Ok(())
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: CommandBufferHandle,
        first_binding: u32,
        buffers: &[BufferHandle],
        offsets: &[u64],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_cmd(cmd)?;
        if buffers.len() != offsets.len() {
            return Err(BackendError::InvalidParameter(format!(
                "{} vertex buffers with {} offsets",
                buffers.len(),
                offsets.len()
            )));
        }
        state.commands.push(RecordedCommand::BindVertexBuffers {
            cmd,
            first_binding,
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
        });
        Ok(())
    }

    fn cmd_push_constants(
        &self,
        cmd: CommandBufferHandle,
        _layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_cmd(cmd)?;
        state.commands.push(RecordedCommand::PushConstants {
            cmd,
            stages,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        _layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_cmd(cmd)?;
        if !state.sets.contains_key(&set.0) {
            return Err(BackendError::InvalidHandle(format!("descriptor set {}", set.0)));
        }
        state.commands.push(RecordedCommand::BindDescriptorSet {
            cmd,
            bind_point,
            set,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferUsage, DescriptorKind};

    #[test]
    fn test_dummy_backend_name() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy");
    }

    #[test]
    fn test_buffer_write_and_readback() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(8, BufferUsage::UNIFORM))
            .unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            backend.buffer_contents(buffer).unwrap(),
            vec![0, 0, 0, 0, 1, 2, 3, 4]
        );

        let err = backend.write_buffer(buffer, 6, &[0; 4]).unwrap_err();
        assert!(matches!(err, BackendError::InvalidParameter(_)));

        backend.destroy_buffer(buffer);
        backend.destroy_buffer(buffer);
        assert_eq!(backend.stats().buffers_destroyed, 1);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_pool_limits_set_count() {
        let backend = DummyBackend::new();
        let layout = backend
            .create_descriptor_set_layout(&[DescriptorLayoutEntry {
                binding: 0,
                kind: DescriptorKind::UniformBuffer,
                stages: ShaderStageFlags::VERTEX,
            }])
            .unwrap();
        let pool = backend.create_descriptor_pool(2, &[]).unwrap();

        let sets = backend.allocate_descriptor_sets(pool, layout, 2).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(
            backend.allocate_descriptor_sets(pool, layout, 1),
            Err(BackendError::OutOfMemory)
        );

        backend.destroy_descriptor_pool(pool);
        assert!(backend.descriptor_writes(sets[0]).is_empty());
    }

    #[test]
    fn test_commands_need_live_command_buffer() {
        let backend = DummyBackend::new();
        let cmd = backend.allocate_command_buffers(1).unwrap()[0];
        backend.begin_commands(cmd, PipelineBindPoint::Compute).unwrap();
        backend.free_command_buffers(&[cmd]);
        assert!(backend.begin_commands(cmd, PipelineBindPoint::Compute).is_err());
        assert_eq!(backend.commands().len(), 1);
    }
}
