//! Binding context.

use bindery_core::DeviceCapabilities;

/// Number of frames the CPU may prepare ahead of the GPU by default.
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 3;

/// Device facts every pipeline build needs.
///
/// # Example
///
/// ```ignore
/// let ctx = BindingContext::new(caps).with_frames_in_flight(2);
/// let pipeline = Pipeline::build(&backend, &ctx, descriptor)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingContext {
    caps: DeviceCapabilities,
    frames_in_flight: u32,
}

impl BindingContext {
    pub fn new(caps: DeviceCapabilities) -> Self {
        Self {
            caps,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
        }
    }

    /// Set the number of in-flight frames. Clamped to at least 1.
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn caps(&self) -> &DeviceCapabilities {
        &self.caps
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }
}

impl Default for BindingContext {
    fn default() -> Self {
        Self::new(DeviceCapabilities::default())
    }
}
