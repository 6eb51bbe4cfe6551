//! # Bindery Core
//!
//! Backend-agnostic half of the resource binding layer.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`types`] - Per-type size, alignment and stride under std140 and std430
//! - [`layout`] - Block layout engine producing [`FieldInfo`] placements
//! - [`source`] - Scene value sources with change generations
//! - [`Block`] - Change-tracked CPU image of a GPU block
//! - [`DeviceCapabilities`] - Device limits consulted while building
//!
//! ## Example
//!
//! ```ignore
//! use bindery_core::{Block, DeviceCapabilities, PackingStandard};
//! use bindery_core::source::{UniformValue, Value, share};
//!
//! let time = share(UniformValue::new(Value::Float(0.0)));
//! let mut block = Block::new("globals", vec![time], PackingStandard::Std140, &caps)?;
//! ```

pub mod block;
pub mod caps;
pub mod error;
pub mod layout;
pub mod source;
pub mod types;

pub use block::{Block, BlockUsage};
pub use caps::{DeviceCapabilities, DeviceFeatures};
pub use error::ConfigurationError;
pub use layout::{BlockLayout, FieldDecl, FieldInfo, compute_layout};
pub use source::{BufferValue, QuaternionValue, SharedSource, UniformValue, Value, ValueSource};
pub use types::{DataType, PackingStandard};

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the crate version once at startup.
pub fn init() {
    log::info!("Bindery Core v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
