//! Device capability limits relevant to resource binding.
//!
//! The values are queried once from the device by the backend and treated as
//! read-only configuration afterwards.

use crate::types::PackingStandard;

bitflags::bitflags! {
    /// Optional device features the binding layer depends on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFeatures: u32 {
        /// Uniform buffer objects.
        const UNIFORM_BUFFER_OBJECT = 1 << 0;
        /// Shader storage buffer objects.
        const SHADER_STORAGE_BUFFER_OBJECT = 1 << 1;
    }
}

/// Limits and features of the target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Supported optional features.
    pub features: DeviceFeatures,
    /// Minimum alignment of a uniform buffer binding offset.
    pub min_uniform_buffer_offset_alignment: u64,
    /// Minimum alignment of a storage buffer binding offset.
    pub min_storage_buffer_offset_alignment: u64,
    /// Maximum uniform buffer descriptors per pipeline.
    pub max_uniform_buffers: u32,
    /// Maximum storage buffer descriptors per pipeline.
    pub max_storage_buffers: u32,
    /// Maximum combined image sampler descriptors per pipeline.
    pub max_sampled_images: u32,
    /// Maximum storage image descriptors per pipeline.
    pub max_storage_images: u32,
    /// Maximum vertex input bindings.
    pub max_vertex_input_bindings: u32,
    /// Maximum push constant range size in bytes.
    pub max_push_constants_size: u32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            features: DeviceFeatures::all(),
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 256,
            max_uniform_buffers: 12,
            max_storage_buffers: 8,
            max_sampled_images: 16,
            max_storage_images: 8,
            max_vertex_input_bindings: 16,
            max_push_constants_size: 128,
        }
    }
}

impl DeviceCapabilities {
    /// Create capabilities with the default desktop limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether blocks packed with `standard` can be used on this device.
    ///
    /// std140 works with either buffer object kind, std430 needs storage buffers.
    pub fn supports(&self, standard: PackingStandard) -> bool {
        match standard {
            PackingStandard::Std140 => self.features.intersects(
                DeviceFeatures::UNIFORM_BUFFER_OBJECT | DeviceFeatures::SHADER_STORAGE_BUFFER_OBJECT,
            ),
            PackingStandard::Std430 => self
                .features
                .contains(DeviceFeatures::SHADER_STORAGE_BUFFER_OBJECT),
        }
    }

    /// Set the feature flags.
    pub fn with_features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Set the minimum uniform buffer offset alignment.
    pub fn with_min_uniform_buffer_offset_alignment(mut self, alignment: u64) -> Self {
        self.min_uniform_buffer_offset_alignment = alignment;
        self
    }

    /// Set the minimum storage buffer offset alignment.
    pub fn with_min_storage_buffer_offset_alignment(mut self, alignment: u64) -> Self {
        self.min_storage_buffer_offset_alignment = alignment;
        self
    }

    /// Set the uniform buffer descriptor limit.
    pub fn with_max_uniform_buffers(mut self, max: u32) -> Self {
        self.max_uniform_buffers = max;
        self
    }

    /// Set the storage buffer descriptor limit.
    pub fn with_max_storage_buffers(mut self, max: u32) -> Self {
        self.max_storage_buffers = max;
        self
    }

    /// Set the combined image sampler descriptor limit.
    pub fn with_max_sampled_images(mut self, max: u32) -> Self {
        self.max_sampled_images = max;
        self
    }

    /// Set the storage image descriptor limit.
    pub fn with_max_storage_images(mut self, max: u32) -> Self {
        self.max_storage_images = max;
        self
    }

    /// Set the vertex input binding limit.
    pub fn with_max_vertex_input_bindings(mut self, max: u32) -> Self {
        self.max_vertex_input_bindings = max;
        self
    }

    /// Set the push constant size limit.
    pub fn with_max_push_constants_size(mut self, max: u32) -> Self {
        self.max_push_constants_size = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_supports_both_standards() {
        let caps = DeviceCapabilities::default();
        assert!(caps.supports(PackingStandard::Std140));
        assert!(caps.supports(PackingStandard::Std430));
    }

    #[test]
    fn test_ubo_only_device() {
        let caps =
            DeviceCapabilities::new().with_features(DeviceFeatures::UNIFORM_BUFFER_OBJECT);
        assert!(caps.supports(PackingStandard::Std140));
        assert!(!caps.supports(PackingStandard::Std430));
    }

    #[test]
    fn test_ssbo_only_device() {
        let caps =
            DeviceCapabilities::new().with_features(DeviceFeatures::SHADER_STORAGE_BUFFER_OBJECT);
        assert!(caps.supports(PackingStandard::Std140));
        assert!(caps.supports(PackingStandard::Std430));
    }

    #[test]
    fn test_no_features() {
        let caps = DeviceCapabilities::new().with_features(DeviceFeatures::empty());
        assert!(!caps.supports(PackingStandard::Std140));
        assert!(!caps.supports(PackingStandard::Std430));
    }
}
