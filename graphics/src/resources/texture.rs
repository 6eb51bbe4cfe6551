//! Texture sources.
//!
//! Images are created and filled elsewhere (file decoding, video import,
//! render targets). This layer only needs the descriptor handles and the
//! per-frame metadata fed to the `<name>_coord_matrix`, `<name>_dimensions`
//! and `<name>_ts` companion uniforms.

use std::fmt;
use std::sync::Arc;

use nalgebra::Matrix4;
use parking_lot::RwLock;

use crate::backend::{ImageHandle, SamplerHandle};

/// A texture bound to a sampler or storage image slot.
pub trait TextureSource: Send + Sync + fmt::Debug {
    /// Image to bind, `None` while no image is available yet.
    fn image(&self) -> Option<ImageHandle>;

    /// Sampler for combined image sampler slots.
    fn sampler(&self) -> Option<SamplerHandle>;

    /// Texture coordinate transform.
    fn coord_matrix(&self) -> Matrix4<f32>;

    /// Width and height in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Presentation time of the current image, in seconds.
    fn timestamp(&self) -> f64;

    /// Advance to time `t`.
    fn update(&mut self, _t: f64) {}
}

/// A texture shared with the scene.
pub type SharedTexture = Arc<RwLock<dyn TextureSource>>;

/// Wrap a texture for sharing.
pub fn share_texture<T: TextureSource + 'static>(texture: T) -> SharedTexture {
    Arc::new(RwLock::new(texture))
}

/// A texture whose image is set from outside.
#[derive(Debug, Clone)]
pub struct StaticTexture {
    image: Option<ImageHandle>,
    sampler: Option<SamplerHandle>,
    coord_matrix: Matrix4<f32>,
    width: u32,
    height: u32,
    timestamp: f64,
}

impl StaticTexture {
    /// A texture without an image yet.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: None,
            sampler: None,
            coord_matrix: Matrix4::identity(),
            width,
            height,
            timestamp: 0.0,
        }
    }

    pub fn with_image(mut self, image: ImageHandle) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerHandle) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_coord_matrix(mut self, matrix: Matrix4<f32>) -> Self {
        self.coord_matrix = matrix;
        self
    }

    /// Swap in a new image, e.g. the next decoded video frame.
    pub fn set_image(&mut self, image: Option<ImageHandle>, timestamp: f64) {
        self.image = image;
        self.timestamp = timestamp;
    }

    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }
}

impl TextureSource for StaticTexture {
    fn image(&self) -> Option<ImageHandle> {
        self.image
    }

    fn sampler(&self) -> Option<SamplerHandle> {
        self.sampler
    }

    fn coord_matrix(&self) -> Matrix4<f32> {
        self.coord_matrix
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

static_assertions::assert_impl_all!(StaticTexture: Send, Sync);
