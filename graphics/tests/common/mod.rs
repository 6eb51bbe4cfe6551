//! Common fixtures for binding integration tests.
//!
//! Builds a small scene against the dummy backend: a lit, textured graphics
//! program whose two stages share a uniform block, plus the matching scene
//! resources.

#![allow(dead_code)]

use std::sync::Arc;

use nalgebra::Matrix4;
use parking_lot::RwLock;

use bindery_core::source::share;
use bindery_core::{
    Block, BufferValue, DataType, DeviceCapabilities, PackingStandard, SharedSource, UniformValue,
    Value,
};
use bindery_graphics::backend::{DummyBackend, Extent2d};
use bindery_graphics::reflection::{InterfaceBinding, ShaderStage, StageReflection, VertexInput};
use bindery_graphics::{
    PipelineDescriptor, PipelineResources, ShaderProgram, ShaderStageProgram, SharedBlock,
    SharedBuffer, SharedTexture, StaticTexture,
};

pub const REGION: u64 = 256;
pub const COLOR_OFFSET: usize = 0;
pub const SCALE_OFFSET: usize = 16;
pub const COORD_MATRIX_OFFSET: usize = 32;
pub const DIMENSIONS_OFFSET: usize = 96;
pub const TS_OFFSET: usize = 104;

pub fn read_f32(data: &[u8], offset: usize) -> f32 {
    f32::from_ne_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Route `log` output to the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

pub fn extent() -> Extent2d {
    Extent2d::new(640, 480)
}

// ============================================================================
// Reflection
// ============================================================================

fn globals() -> InterfaceBinding {
    InterfaceBinding::uniform_block("globals", 0, 112)
        .with_variable("color", COLOR_OFFSET as u32)
        .with_variable("scale", SCALE_OFFSET as u32)
        .with_variable("tex0_coord_matrix", COORD_MATRIX_OFFSET as u32)
        .with_variable("tex0_dimensions", DIMENSIONS_OFFSET as u32)
        .with_variable("tex0_ts", TS_OFFSET as u32)
}

pub fn vertex_reflection() -> StageReflection {
    StageReflection::new(ShaderStage::Vertex)
        .with_binding(InterfaceBinding::push_constants("transforms", 128))
        .with_binding(globals())
        .with_input(VertexInput::new("ngl_position", 0))
        .with_input(VertexInput::new("ngl_normal", 1))
        .with_input(VertexInput::new("instance_offset", 2))
}

pub fn fragment_reflection() -> StageReflection {
    StageReflection::new(ShaderStage::Fragment)
        .with_binding(InterfaceBinding::push_constants("transforms", 128))
        .with_binding(globals())
        .with_binding(InterfaceBinding::sampler("tex0_sampler", 1))
        .with_binding(InterfaceBinding::storage_block("lights", 2, 32))
}

pub fn graphics_program(backend: &DummyBackend) -> ShaderProgram {
    ShaderProgram::graphics(
        ShaderStageProgram::new(backend.import_shader_module(), vertex_reflection()),
        ShaderStageProgram::new(backend.import_shader_module(), fragment_reflection()),
    )
}

// ============================================================================
// Scene
// ============================================================================

/// Resources of the test scene, kept so tests can mutate them.
pub struct Scene {
    pub color: Arc<RwLock<UniformValue>>,
    pub scale: Arc<RwLock<UniformValue>>,
    pub texture: Arc<RwLock<StaticTexture>>,
    pub lights: SharedBlock,
    pub positions: SharedBuffer,
    pub normals: SharedBuffer,
}

impl Scene {
    pub fn new(backend: &DummyBackend) -> Self {
        init_logging();
        let caps = DeviceCapabilities::default();
        let light = share(UniformValue::new(Value::Vec4([1.0, 1.0, 1.0, 1.0])));
        let intensity = share(UniformValue::new(Value::Float(0.5)));
        let lights = SharedBlock::new(
            Block::new("lights", vec![light, intensity], PackingStandard::Std430, &caps)
                .unwrap(),
        );

        let texture = Arc::new(RwLock::new(
            StaticTexture::new(320, 240)
                .with_image(backend.import_image())
                .with_sampler(backend.import_sampler())
                .with_coord_matrix(Matrix4::new_scaling(2.0)),
        ));

        Self {
            color: Arc::new(RwLock::new(UniformValue::new(Value::Vec4([
                0.25, 0.5, 0.75, 1.0,
            ])))),
            scale: Arc::new(RwLock::new(UniformValue::new(Value::Float(3.0)))),
            texture,
            lights,
            positions: SharedBuffer::new(share(
                BufferValue::from_slice(DataType::Vec3, &[[0.0f32, 1.0, 0.0]; 3]).unwrap(),
            )),
            normals: SharedBuffer::new(share(
                BufferValue::from_slice(DataType::Vec3, &[[0.0f32, 0.0, 1.0]; 3]).unwrap(),
            )),
        }
    }

    pub fn resources(&self) -> PipelineResources {
        let color: SharedSource = self.color.clone();
        let scale: SharedSource = self.scale.clone();
        let unused: SharedSource = share(UniformValue::new(Value::Float(9.0)));
        let texture: SharedTexture = self.texture.clone();

        PipelineResources::new()
            .with_uniform("color", color)
            .with_uniform("scale", scale)
            .with_uniform("unused", unused)
            .with_texture("tex0", texture)
            .with_block("lights", self.lights.clone())
            .with_attribute("ngl_position", self.positions.clone())
            .with_attribute("ngl_normal", self.normals.clone())
    }

    pub fn descriptor(&self, backend: &DummyBackend) -> PipelineDescriptor {
        PipelineDescriptor::new(graphics_program(backend))
            .with_label("scene")
            .with_resources(self.resources())
    }
}
