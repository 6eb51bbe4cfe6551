//! Change-tracked block storage.
//!
//! A [`Block`] owns the CPU-side byte image of a uniform or storage block. It is
//! built once from an ordered list of value sources, laid out with the
//! [layout engine](crate::layout), and fully packed at construction. After that,
//! [`Block::refresh`] only re-packs the fields whose source reports a change and
//! raises the dirty flag so the owner knows to upload.
//!
//! # Example
//!
//! ```ignore
//! let color = share(UniformValue::new(Value::Vec4([1.0, 0.0, 0.0, 1.0])));
//! let mut block = Block::new("material", vec![color.clone()], PackingStandard::Std140, &caps)?;
//! upload(block.data());
//! block.clear_dirty();
//!
//! // Later, once per frame
//! if block.refresh(false) {
//!     upload(block.data());
//!     block.clear_dirty();
//! }
//! ```

use std::fmt;

use crate::caps::DeviceCapabilities;
use crate::error::ConfigurationError;
use crate::layout::{BlockLayout, FieldInfo, compute_layout};
use crate::source::SharedSource;
use crate::types::PackingStandard;

/// Upload frequency hint for the block's GPU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockUsage {
    /// Contents are written once.
    #[default]
    Static,
    /// At least one field is live and changes every frame.
    Dynamic,
}

// ============================================================================
// Tracked fields
// ============================================================================

/// Change detection and packing for one field.
///
/// The implementation is picked once per field when the block is built, so the
/// per-frame path never inspects the source kind.
trait TrackedField: Send + Sync + fmt::Debug {
    fn source(&self) -> &SharedSource;

    fn has_changed(&self) -> bool;

    /// Whether the source was mutated since the last copy, ignoring liveness.
    fn is_stale(&self) -> bool;

    /// Pack the source into `dst` (the whole block image) at `info`.
    fn write_into(&mut self, dst: &mut [u8], info: &FieldInfo);
}

/// Last source generation copied into the block, `None` before the first copy.
fn source_changed(source: &SharedSource, seen: Option<u64>) -> bool {
    let source = source.read();
    source.is_live() || seen != Some(source.generation())
}

fn source_stale(source: &SharedSource, seen: Option<u64>) -> bool {
    seen != Some(source.read().generation())
}

/// A single value, always copied in one piece.
#[derive(Debug)]
struct ValueField {
    source: SharedSource,
    seen: Option<u64>,
}

impl TrackedField for ValueField {
    fn source(&self) -> &SharedSource {
        &self.source
    }

    fn has_changed(&self) -> bool {
        source_changed(&self.source, self.seen)
    }

    fn is_stale(&self) -> bool {
        source_stale(&self.source, self.seen)
    }

    fn write_into(&mut self, dst: &mut [u8], info: &FieldInfo) {
        let source = self.source.read();
        let data = source.data();
        let len = data.len().min(info.size as usize);
        let start = info.offset as usize;
        dst[start..start + len].copy_from_slice(&data[..len]);
        self.seen = Some(source.generation());
    }
}

/// An array, copied through [`FieldInfo::write`] so the CPU stride is expanded
/// to the GPU stride when they differ.
#[derive(Debug)]
struct ArrayField {
    source: SharedSource,
    seen: Option<u64>,
}

impl TrackedField for ArrayField {
    fn source(&self) -> &SharedSource {
        &self.source
    }

    fn has_changed(&self) -> bool {
        source_changed(&self.source, self.seen)
    }

    fn is_stale(&self) -> bool {
        source_stale(&self.source, self.seen)
    }

    fn write_into(&mut self, dst: &mut [u8], info: &FieldInfo) {
        let source = self.source.read();
        info.write(dst, source.data(), source.data_stride());
        self.seen = Some(source.generation());
    }
}

// ============================================================================
// Block
// ============================================================================

/// CPU image of a GPU block with per-field change tracking.
#[derive(Debug)]
pub struct Block {
    label: String,
    layout: BlockLayout,
    fields: Vec<Box<dyn TrackedField>>,
    data: Vec<u8>,
    dirty: bool,
    usage: BlockUsage,
}

impl Block {
    /// Lay out `sources` under `standard` and pack all of them.
    ///
    /// Fails if the device cannot use `standard` or if an array source is empty.
    /// The returned block is dirty.
    pub fn new(
        label: impl Into<String>,
        sources: Vec<SharedSource>,
        standard: PackingStandard,
        caps: &DeviceCapabilities,
    ) -> Result<Self, ConfigurationError> {
        let label = label.into();

        if !caps.supports(standard) {
            log::error!("{standard} blocks are not supported by this device");
            return Err(ConfigurationError::UnsupportedStandard {
                block: label,
                standard,
            });
        }

        let mut decls = Vec::with_capacity(sources.len());
        let mut fields: Vec<Box<dyn TrackedField>> = Vec::with_capacity(sources.len());
        let mut usage = BlockUsage::Static;

        for (index, source) in sources.into_iter().enumerate() {
            let (decl, count, live) = {
                let guard = source.read();
                (guard.decl(), guard.element_count(), guard.is_live())
            };
            match count {
                Some(0) => {
                    return Err(ConfigurationError::EmptyArray {
                        block: label,
                        field: index,
                    });
                }
                Some(_) => fields.push(Box::new(ArrayField { source, seen: None })),
                None => fields.push(Box::new(ValueField { source, seen: None })),
            }
            if live {
                usage = BlockUsage::Dynamic;
            }
            decls.push(decl);
        }

        let layout = compute_layout(&decls, standard);
        for (i, info) in layout.fields().iter().enumerate() {
            log::debug!(
                "{label}.field[{i}]: {} offset={} size={} stride={}",
                decls[i].data_type,
                info.offset,
                info.size,
                info.stride
            );
        }
        log::debug!("total {label} size: {}", layout.size());

        let mut block = Self {
            data: vec![0; layout.size() as usize],
            label,
            layout,
            fields,
            dirty: false,
            usage,
        };
        block.refresh(true);
        Ok(block)
    }

    /// Re-pack every changed field, or every field when `forced`.
    ///
    /// Returns whether anything was copied. The dirty flag is raised in that case
    /// and stays raised until [`clear_dirty`](Self::clear_dirty).
    pub fn refresh(&mut self, forced: bool) -> bool {
        let mut changed = false;
        for (field, info) in self.fields.iter_mut().zip(self.layout.fields()) {
            if forced || field.has_changed() {
                field.write_into(&mut self.data, info);
                changed = true;
            }
        }
        if changed {
            log::trace!("{}: refreshed (forced={forced})", self.label);
            self.dirty = true;
        }
        changed
    }

    /// Re-pack only the fields whose source was edited since their last copy.
    ///
    /// Live sources count as unchanged here, so calling this again within one
    /// update tick uploads nothing new.
    pub fn refresh_edited(&mut self) -> bool {
        let mut changed = false;
        for (field, info) in self.fields.iter_mut().zip(self.layout.fields()) {
            if field.is_stale() {
                field.write_into(&mut self.data, info);
                changed = true;
            }
        }
        if changed {
            log::trace!("{}: re-packed edited fields", self.label);
            self.dirty = true;
        }
        changed
    }

    /// Advance every source to time `t`, then refresh.
    pub fn update(&mut self, t: f64) -> bool {
        for field in &self.fields {
            field.source().write().update(t);
        }
        self.refresh(false)
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Packing standard of the block.
    pub fn standard(&self) -> PackingStandard {
        self.layout.standard()
    }

    /// Computed layout.
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Placement of field `index`.
    pub fn field_info(&self, index: usize) -> Option<&FieldInfo> {
        self.layout.field(index)
    }

    /// Source backing field `index`.
    pub fn source(&self, index: usize) -> Option<&SharedSource> {
        self.fields.get(index).map(|field| field.source())
    }

    /// Number of fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Packed size in bytes.
    pub fn size(&self) -> u32 {
        self.layout.size()
    }

    /// Packed contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Usage hint derived at construction.
    pub fn usage(&self) -> BlockUsage {
        self.usage
    }

    /// Whether the contents changed since the last [`clear_dirty`](Self::clear_dirty).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Acknowledge that the current contents were uploaded.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::DeviceFeatures;
    use crate::source::{BufferValue, UniformValue, Value, share};
    use crate::types::DataType;
    use parking_lot::RwLock;

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_new_packs_everything() {
        let a = share(UniformValue::new(Value::Float(1.0)));
        let b = share(UniformValue::new(Value::Vec3([2.0, 3.0, 4.0])));
        let block = Block::new(
            "test",
            vec![a, b],
            PackingStandard::Std140,
            &DeviceCapabilities::default(),
        )
        .unwrap();

        assert_eq!(block.size(), 28);
        assert!(block.is_dirty());
        let data = floats(block.data());
        assert_eq!(data[0], 1.0);
        assert_eq!(&data[4..7], &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_refresh_twice_is_idempotent() {
        let value = UniformValue::new(Value::Float(1.0));
        let source = share(value);
        let mut block = Block::new(
            "test",
            vec![source.clone()],
            PackingStandard::Std140,
            &DeviceCapabilities::default(),
        )
        .unwrap();
        block.clear_dirty();

        assert!(!block.refresh(false));
        assert!(!block.is_dirty());
        assert!(!block.refresh(false));
        assert!(!block.is_dirty());
    }

    #[test]
    fn test_forced_refresh_marks_dirty() {
        let source = share(UniformValue::new(Value::Int(7)));
        let mut block = Block::new(
            "test",
            vec![source],
            PackingStandard::Std430,
            &DeviceCapabilities::default(),
        )
        .unwrap();
        block.clear_dirty();

        assert!(block.refresh(true));
        assert!(block.is_dirty());
    }

    #[test]
    fn test_unsupported_standard() {
        let caps = DeviceCapabilities::new().with_features(DeviceFeatures::UNIFORM_BUFFER_OBJECT);
        let source = share(UniformValue::new(Value::Float(0.0)));
        let err = Block::new("particles", vec![source], PackingStandard::Std430, &caps).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnsupportedStandard {
                block: "particles".to_string(),
                standard: PackingStandard::Std430,
            }
        );
    }

    #[test]
    fn test_empty_array_rejected() {
        let empty = share(BufferValue::new(DataType::Vec4, Vec::new(), 16).unwrap());
        let err = Block::new(
            "test",
            vec![empty],
            PackingStandard::Std140,
            &DeviceCapabilities::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::EmptyArray {
                block: "test".to_string(),
                field: 0
            }
        );
    }

    #[test]
    fn test_usage_follows_live_sources() {
        let caps = DeviceCapabilities::default();
        let still = share(UniformValue::new(Value::Float(0.0)));
        let block = Block::new("a", vec![still.clone()], PackingStandard::Std140, &caps).unwrap();
        assert_eq!(block.usage(), BlockUsage::Static);

        let live = share(UniformValue::new(Value::Float(0.0)).with_live(true));
        let block = Block::new("b", vec![still, live], PackingStandard::Std140, &caps).unwrap();
        assert_eq!(block.usage(), BlockUsage::Dynamic);
    }

    #[test]
    fn test_live_source_always_refreshes() {
        let live = share(UniformValue::new(Value::Float(0.0)).with_live(true));
        let mut block = Block::new(
            "test",
            vec![live],
            PackingStandard::Std140,
            &DeviceCapabilities::default(),
        )
        .unwrap();
        block.clear_dirty();
        assert!(block.refresh(false));
        assert!(block.refresh(false));
    }

    #[test]
    fn test_refresh_edited_skips_live_fields() {
        let live = share(UniformValue::new(Value::Float(0.0)).with_live(true));
        let still = std::sync::Arc::new(RwLock::new(UniformValue::new(Value::Float(1.0))));
        let shared: SharedSource = still.clone();
        let mut block = Block::new(
            "test",
            vec![live, shared],
            PackingStandard::Std140,
            &DeviceCapabilities::default(),
        )
        .unwrap();
        block.clear_dirty();

        assert!(!block.refresh_edited());
        assert!(!block.is_dirty());

        still.write().set(Value::Float(4.0)).unwrap();
        assert!(block.refresh_edited());
        assert!(block.is_dirty());
        assert_eq!(floats(block.data())[1], 4.0);
        assert!(!block.refresh_edited());
    }

    #[test]
    fn test_field_accessors() {
        let a = share(UniformValue::new(Value::Float(0.0)));
        let b = share(UniformValue::new(Value::Mat4([0.0; 16])));
        let block = Block::new(
            "test",
            vec![a, b.clone()],
            PackingStandard::Std140,
            &DeviceCapabilities::default(),
        )
        .unwrap();
        assert_eq!(block.field_count(), 2);
        assert_eq!(block.field_info(1).map(|f| f.offset), Some(16));
        assert!(std::sync::Arc::ptr_eq(block.source(1).unwrap(), &b));
        assert!(block.field_info(2).is_none());
    }
}
