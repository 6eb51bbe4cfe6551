//! # Bindery Graphics
//!
//! Reflection-driven resource binding for scene-graph pipelines.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`reflection`] - Per-stage shader interfaces merged into one [`InterfaceMap`]
//! - [`resources`] - Blocks, buffers and textures shared between pipelines
//! - [`Pipeline`] - Build-time resolution of named resources to binding slots
//! - [`frame`] - Per-frame update, rebuild on resize and ordered binds
//! - [`BindingBackend`] - Trait for device implementations: Vulkan and Dummy (for testing)
//!
//! ## Example
//!
//! ```ignore
//! use bindery_graphics::{BindingContext, DummyBackend, Pipeline, PipelineDescriptor};
//!
//! let backend = DummyBackend::new();
//! let ctx = BindingContext::default();
//! let mut pipeline = Pipeline::build(&backend, &ctx, descriptor)?;
//! for (frame, t) in frames {
//!     pipeline.update(&backend, t, extent)?;
//!     let cmd = pipeline.bind_frame(&backend, frame % ctx.frames_in_flight(), &transforms)?;
//!     // draw...
//! }
//! pipeline.release(&backend);
//! ```

pub mod backend;
pub mod context;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod reflection;
pub mod resources;
pub mod state;

// Re-export main types for convenience
pub use backend::{BackendError, BindingBackend, DummyBackend, Extent2d};
pub use context::BindingContext;
pub use error::BindingError;
pub use frame::Transforms;
pub use pipeline::{
    Pipeline, PipelineDescriptor, PipelineResources, PipelineStatus, ShaderProgram,
    ShaderStageProgram,
};
pub use reflection::{InterfaceBinding, InterfaceMap, ShaderStage, StageReflection, VertexInput};
pub use resources::{SharedBlock, SharedBuffer, SharedTexture, StaticTexture, TextureSource};
pub use state::GraphicsState;

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
pub fn init() {
    bindery_core::init();
    log::info!("Bindery Graphics v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy");
    }
}
