//! Per-frame update and bind.
//!
//! Each frame the render thread calls [`Pipeline::update`] with the scene time
//! and the target extent, then [`Pipeline::bind_frame`] with the index of the
//! in-flight frame being recorded. Binds are recorded in a fixed order:
//!
//! 1. pipeline object
//! 2. vertex and instance buffers (graphics only)
//! 3. transform push constants (graphics only)
//! 4. descriptor set of the frame
//!
//! The caller fences the frame index: region `i` of the uniform buffer and
//! descriptor set `i` must no longer be read by the GPU when frame `i` is bound
//! again.

use nalgebra::Matrix4;

use crate::backend::{
    BindingBackend, BufferHandle, CommandBufferHandle, ComputePipelineDescriptor, DescriptorKind,
    DescriptorWrite, Extent2d, GraphicsPipelineDescriptor, PipelineBindPoint,
};
use crate::error::BindingError;
use crate::pipeline::{Pipeline, PipelineStatus, ShaderProgram};

/// Camera matrices pushed to graphics pipelines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transforms {
    pub modelview: Matrix4<f32>,
    pub projection: Matrix4<f32>,
}

impl Transforms {
    pub fn new(modelview: Matrix4<f32>, projection: Matrix4<f32>) -> Self {
        Self {
            modelview,
            projection,
        }
    }
}

impl Default for Transforms {
    fn default() -> Self {
        Self::new(Matrix4::identity(), Matrix4::identity())
    }
}

fn matrix_bytes(matrix: &Matrix4<f32>) -> &[u8] {
    bytemuck::cast_slice(matrix.as_slice())
}

fn write_at(dst: &mut [u8], offset: u32, bytes: &[u8]) {
    let start = offset as usize;
    let end = (start + bytes.len()).min(dst.len());
    if start < end {
        dst[start..end].copy_from_slice(&bytes[..end - start]);
    }
}

impl Pipeline {
    /// Advance every bound resource to time `t` and make sure the native
    /// pipeline matches `extent`.
    ///
    /// Shared blocks and buffers upload at most once per `t`. The native
    /// pipeline is created on the first call and recreated whenever a graphics
    /// pipeline sees a new extent; that path waits for the device to go idle.
    pub fn update(
        &mut self,
        backend: &dyn BindingBackend,
        t: f64,
        extent: Extent2d,
    ) -> Result<(), BindingError> {
        if self.released {
            return Err(BindingError::NotBuilt);
        }

        for pair in &self.textures {
            pair.texture.write().update(t);
        }
        for pair in &self.uniforms {
            pair.source.write().update(t);
        }
        for pair in &self.blocks {
            pair.block.update(backend, t)?;
        }
        for buffer in &self.vertex_buffers {
            buffer.update(backend, t)?;
        }

        let resized = self.bind_point() == PipelineBindPoint::Graphics && self.extent != Some(extent);
        if self.native.is_none() || resized {
            self.rebuild(backend, extent)?;
        }
        Ok(())
    }

    fn rebuild(&mut self, backend: &dyn BindingBackend, extent: Extent2d) -> Result<(), BindingError> {
        let previous = self.extent.unwrap_or_default();
        log::info!("{}: reconfigure from {previous} to {extent}", self.label);
        self.status = PipelineStatus::DirtyRebuild;

        if self.native.is_some() || !self.command_buffers.is_empty() {
            backend.wait_idle()?;
        }
        self.destroy_native(backend);

        self.command_buffers = backend.allocate_command_buffers(self.frames)?;
        let native = match &self.program {
            ShaderProgram::Graphics { vertex, fragment } => {
                backend.create_graphics_pipeline(&GraphicsPipelineDescriptor {
                    label: Some(self.label.clone()),
                    layout: self.pipeline_layout,
                    vertex: vertex.module,
                    fragment: fragment.module,
                    vertex_bindings: self.vertex_bindings.clone(),
                    vertex_attributes: self.vertex_attributes.clone(),
                    state: self.graphics_state,
                    extent,
                })?
            }
            ShaderProgram::Compute(stage) => {
                backend.create_compute_pipeline(&ComputePipelineDescriptor {
                    label: Some(self.label.clone()),
                    layout: self.pipeline_layout,
                    module: stage.module,
                })?
            }
        };

        self.native = Some(native);
        self.extent = Some(extent);
        self.status = PipelineStatus::Bound;
        Ok(())
    }

    /// Upload the uniform region of `frame_index` and record the binds into
    /// that frame's command buffer.
    ///
    /// Returns the command buffer, ready for draw or dispatch commands.
    ///
    /// # Errors
    ///
    /// - [`BindingError::NotBuilt`] before the first [`update`](Self::update) or after release
    /// - [`BindingError::InvalidFrameIndex`] if `frame_index` is not below the frames in flight
    pub fn bind_frame(
        &mut self,
        backend: &dyn BindingBackend,
        frame_index: u32,
        transforms: &Transforms,
    ) -> Result<CommandBufferHandle, BindingError> {
        let Some(native) = self.native else {
            return Err(BindingError::NotBuilt);
        };
        if frame_index >= self.frames {
            return Err(BindingError::InvalidFrameIndex {
                index: frame_index,
                frames: self.frames,
            });
        }
        let index = frame_index as usize;
        let (Some(&cmd), Some(&set)) = (
            self.command_buffers.get(index),
            self.descriptor_sets.get(index),
        ) else {
            return Err(BindingError::NotBuilt);
        };

        if let Some(buffer) = self.uniform_buffer {
            self.upload_uniforms(backend, buffer, frame_index)?;
        }

        let writes: Vec<DescriptorWrite> = self
            .textures
            .iter()
            .filter_map(|pair| {
                let texture = pair.texture.read();
                let image = texture.image()?;
                let sampler = match pair.kind {
                    DescriptorKind::CombinedImageSampler => texture.sampler(),
                    _ => None,
                };
                Some(DescriptorWrite::Image {
                    binding: pair.binding,
                    kind: pair.kind,
                    image,
                    sampler,
                })
            })
            .collect();
        if !writes.is_empty() {
            backend.update_descriptor_set(set, &writes)?;
        }

        let bind_point = self.bind_point();
        backend.begin_commands(cmd, bind_point)?;
        backend.cmd_bind_pipeline(cmd, bind_point, native)?;

        if bind_point == PipelineBindPoint::Graphics {
            if !self.vertex_buffers.is_empty() {
                let mut buffers = Vec::with_capacity(self.vertex_buffers.len());
                let mut offsets = Vec::with_capacity(self.vertex_buffers.len());
                for buffer in &self.vertex_buffers {
                    let Some(handle) = buffer.buffer() else {
                        return Err(BindingError::NotBuilt);
                    };
                    buffers.push(handle);
                    offsets.push(buffer.bind_offset());
                }
                backend.cmd_bind_vertex_buffers(cmd, 0, &buffers, &offsets)?;
            }

            if self.transform_size >= 64 {
                backend.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    self.transform_stages,
                    0,
                    matrix_bytes(&transforms.modelview),
                )?;
            }
            if self.transform_size >= 128 {
                backend.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    self.transform_stages,
                    64,
                    matrix_bytes(&transforms.projection),
                )?;
            }
        }

        backend.cmd_bind_descriptor_set(cmd, bind_point, self.pipeline_layout, set)?;
        Ok(cmd)
    }

    /// What a frame region would hold if packed now.
    fn region_stamp(&self) -> RegionStamp {
        let uniforms = self
            .uniforms
            .iter()
            .map(|pair| pair.source.read().generation())
            .collect();
        let textures = self
            .textures
            .iter()
            .map(|pair| {
                let texture = pair.texture.read();
                texture.image()?;
                Some(TextureStamp {
                    coord_matrix: texture.coord_matrix(),
                    dimensions: texture.dimensions(),
                    timestamp: texture.timestamp(),
                })
            })
            .collect();
        RegionStamp { uniforms, textures }
    }

    /// Pack uniforms and texture companions into region `frame_index`.
    ///
    /// Skipped when the region already holds the current values and no
    /// uniform is live.
    fn upload_uniforms(
        &mut self,
        backend: &dyn BindingBackend,
        buffer: BufferHandle,
        frame_index: u32,
    ) -> Result<(), BindingError> {
        let index = frame_index as usize;
        let live = self.uniforms.iter().any(|pair| pair.source.read().is_live());
        let stamp = self.region_stamp();
        if !live && self.region_stamps.get(index).and_then(Option::as_ref) == Some(&stamp) {
            return Ok(());
        }

        for pair in &self.uniforms {
            let source = pair.source.read();
            pair.info
                .write(&mut self.staging, source.data(), source.data_stride());
        }

        for pair in &self.textures {
            let texture = pair.texture.read();
            if texture.image().is_none() {
                continue;
            }
            if let Some(offset) = pair.coord_matrix {
                write_at(&mut self.staging, offset, matrix_bytes(&texture.coord_matrix()));
            }
            if let Some(offset) = pair.dimensions {
                let (width, height) = texture.dimensions();
                let dimensions = [width as f32, height as f32];
                write_at(&mut self.staging, offset, bytemuck::bytes_of(&dimensions));
            }
            if let Some(offset) = pair.timestamp {
                let timestamp = texture.timestamp() as f32;
                write_at(&mut self.staging, offset, bytemuck::bytes_of(&timestamp));
            }
        }

        let offset = u64::from(frame_index) * self.region_size;
        backend.write_buffer(buffer, offset, &self.staging)?;
        if let Some(slot) = self.region_stamps.get_mut(index) {
            *slot = Some(stamp);
        }
        Ok(())
    }
}

/// Source state last packed into one frame region of the uniform buffer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RegionStamp {
    uniforms: Vec<u64>,
    /// `None` for textures without an image; their companions are not written.
    textures: Vec<Option<TextureStamp>>,
}

#[derive(Debug, Clone, PartialEq)]
struct TextureStamp {
    coord_matrix: Matrix4<f32>,
    dimensions: (u32, u32),
    timestamp: f64,
}
