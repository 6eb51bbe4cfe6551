//! Vertex and instance buffers.
//!
//! A [`SharedBuffer`] feeds one vertex attribute. It either owns a GPU buffer
//! holding its source verbatim, or it is a field of a [`SharedBlock`] and reads
//! from the block's buffer at the field's offset. Either way the stride seen by
//! the vertex input stage comes from a single [`FieldInfo`].

use std::sync::Arc;

use bindery_core::{DataType, FieldInfo, SharedSource};
use parking_lot::Mutex;

use crate::backend::{BackendError, BindingBackend, BufferDescriptor, BufferHandle, BufferUsage};

use super::SharedBlock;

#[derive(Debug, Default)]
struct StandaloneBuffer {
    buffer: Option<BufferHandle>,
    refs: u32,
    seen: Option<u64>,
    last_update: Option<f64>,
}

#[derive(Debug, Clone)]
enum Backing {
    Standalone(Arc<Mutex<StandaloneBuffer>>),
    Block { block: SharedBlock, field: usize },
}

/// A buffer source bound as a vertex or instance attribute.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    source: SharedSource,
    backing: Backing,
}

impl SharedBuffer {
    /// A buffer uploaded into its own GPU buffer.
    pub fn new(source: SharedSource) -> Self {
        Self {
            source,
            backing: Backing::Standalone(Arc::default()),
        }
    }

    /// Field `field` of `block`. `None` if the block has no such field.
    pub fn in_block(block: SharedBlock, field: usize) -> Option<Self> {
        let source = block.source(field)?;
        Some(Self {
            source,
            backing: Backing::Block { block, field },
        })
    }

    pub fn source(&self) -> &SharedSource {
        &self.source
    }

    pub fn data_type(&self) -> DataType {
        self.source.read().data_type()
    }

    /// Number of elements.
    pub fn count(&self) -> u32 {
        self.source.read().element_count().unwrap_or(1)
    }

    /// Block holding this buffer, if any.
    pub fn block(&self) -> Option<&SharedBlock> {
        match &self.backing {
            Backing::Standalone(_) => None,
            Backing::Block { block, .. } => Some(block),
        }
    }

    /// GPU placement of the data.
    pub fn field_info(&self) -> FieldInfo {
        match &self.backing {
            Backing::Standalone(_) => {
                let source = self.source.read();
                FieldInfo::standalone(
                    source.data_type(),
                    source.element_count().unwrap_or(1),
                    source.data_stride(),
                )
            }
            Backing::Block { block, field } => block.field_info(*field).unwrap_or(FieldInfo {
                offset: 0,
                size: 0,
                stride: 0,
            }),
        }
    }

    /// Byte offset to bind the GPU buffer at.
    pub fn bind_offset(&self) -> u64 {
        match &self.backing {
            Backing::Standalone(_) => 0,
            Backing::Block { .. } => u64::from(self.field_info().offset),
        }
    }

    /// GPU buffer, present while at least one reference is held.
    pub fn buffer(&self) -> Option<BufferHandle> {
        match &self.backing {
            Backing::Standalone(inner) => inner.lock().buffer,
            Backing::Block { block, .. } => block.buffer(),
        }
    }

    /// Number of holders of the GPU storage.
    pub fn ref_count(&self) -> u32 {
        match &self.backing {
            Backing::Standalone(inner) => inner.lock().refs,
            Backing::Block { block, .. } => block.ref_count(),
        }
    }

    /// Take a reference, creating and filling the GPU buffer on the first one.
    pub fn acquire(&self, backend: &dyn BindingBackend) -> Result<BufferHandle, BackendError> {
        let inner = match &self.backing {
            Backing::Standalone(inner) => inner,
            Backing::Block { block, .. } => return block.acquire(backend),
        };

        let mut inner = inner.lock();
        if let Some(buffer) = inner.buffer {
            inner.refs += 1;
            return Ok(buffer);
        }

        let info = self.field_info();
        let source = self.source.read();
        let descriptor = BufferDescriptor::new(
            u64::from(info.size.max(1)),
            BufferUsage::VERTEX | BufferUsage::STORAGE,
        )
        .with_dynamic(source.is_live());
        let buffer = backend.create_buffer(&descriptor)?;
        if let Err(err) = backend.write_buffer(buffer, 0, source.data()) {
            backend.destroy_buffer(buffer);
            return Err(err);
        }
        inner.seen = Some(source.generation());
        inner.buffer = Some(buffer);
        inner.refs = 1;
        Ok(buffer)
    }

    /// Drop a reference, destroying the GPU buffer with the last one.
    pub fn release(&self, backend: &dyn BindingBackend) {
        let inner = match &self.backing {
            Backing::Standalone(inner) => inner,
            Backing::Block { block, .. } => return block.release(backend),
        };

        let mut inner = inner.lock();
        if inner.refs == 0 {
            return;
        }
        inner.refs -= 1;
        if inner.refs == 0 {
            if let Some(buffer) = inner.buffer.take() {
                backend.destroy_buffer(buffer);
            }
            inner.seen = None;
            inner.last_update = None;
        }
    }

    /// Advance the source to time `t` and upload it if it changed.
    ///
    /// The source advances at most once per distinct `t`, but edits made
    /// between two calls with the same `t` are still uploaded. Buffers inside
    /// a block defer to the block.
    pub fn update(&self, backend: &dyn BindingBackend, t: f64) -> Result<bool, BackendError> {
        let inner = match &self.backing {
            Backing::Standalone(inner) => inner,
            Backing::Block { block, .. } => return block.update(backend, t),
        };

        let mut inner = inner.lock();
        let advanced = inner.last_update != Some(t);
        if advanced {
            inner.last_update = Some(t);
            self.source.write().update(t);
        }

        let Some(buffer) = inner.buffer else {
            return Ok(false);
        };
        let source = self.source.read();
        let live = advanced && source.is_live();
        if !live && inner.seen == Some(source.generation()) {
            return Ok(false);
        }
        backend.write_buffer(buffer, 0, source.data())?;
        inner.seen = Some(source.generation());
        Ok(true)
    }
}

static_assertions::assert_impl_all!(SharedBuffer: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use bindery_core::{Block, BufferValue, DeviceCapabilities, PackingStandard, UniformValue, Value};
    use parking_lot::RwLock;

    #[test]
    fn test_standalone_uses_source_stride() {
        let source = bindery_core::source::share(
            BufferValue::from_slice(DataType::Vec3, &[[0.0f32; 3]; 4]).unwrap(),
        );
        let buffer = SharedBuffer::new(source);
        let info = buffer.field_info();
        assert_eq!(info.stride, 12);
        assert_eq!(info.size, 48);
        assert_eq!(buffer.bind_offset(), 0);
        assert_eq!(buffer.count(), 4);
    }

    #[test]
    fn test_standalone_upload_on_change() {
        let backend = DummyBackend::new();
        let value = Arc::new(RwLock::new(
            BufferValue::from_slice(DataType::Float, &[1.0f32, 2.0]).unwrap(),
        ));
        let source: SharedSource = value.clone();
        let buffer = SharedBuffer::new(source);

        let handle = buffer.acquire(&backend).unwrap();
        assert!(!buffer.update(&backend, 0.0).unwrap());

        value.write().set_element(1, &5.0f32).unwrap();
        assert!(buffer.update(&backend, 1.0).unwrap());
        let contents = backend.buffer_contents(handle).unwrap();
        assert_eq!(&contents[4..8], &5.0f32.to_ne_bytes());

        buffer.release(&backend);
        assert!(buffer.buffer().is_none());
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_edit_at_same_time_uploads() {
        let backend = DummyBackend::new();
        let value = Arc::new(RwLock::new(
            BufferValue::from_slice(DataType::Float, &[1.0f32, 2.0]).unwrap(),
        ));
        let source: SharedSource = value.clone();
        let buffer = SharedBuffer::new(source);
        let handle = buffer.acquire(&backend).unwrap();

        assert!(!buffer.update(&backend, 0.0).unwrap());
        value.write().set_element(1, &5.0f32).unwrap();
        assert!(buffer.update(&backend, 0.0).unwrap());
        let contents = backend.buffer_contents(handle).unwrap();
        assert_eq!(&contents[4..8], &5.0f32.to_ne_bytes());

        let writes = backend.stats().buffer_writes;
        assert!(!buffer.update(&backend, 0.0).unwrap());
        assert_eq!(backend.stats().buffer_writes, writes);
    }

    #[test]
    fn test_in_block_binds_block_buffer() {
        let backend = DummyBackend::new();
        let caps = DeviceCapabilities::default();
        let scale = bindery_core::source::share(UniformValue::new(Value::Float(1.0)));
        let points = bindery_core::source::share(
            BufferValue::from_slice(DataType::Vec3, &[[0.0f32; 3]; 2]).unwrap(),
        );
        let block = SharedBlock::new(
            Block::new("geometry", vec![scale, points], PackingStandard::Std430, &caps).unwrap(),
        );

        let buffer = SharedBuffer::in_block(block.clone(), 1).unwrap();
        assert_eq!(buffer.bind_offset(), 16);
        assert_eq!(buffer.field_info().stride, 16);
        assert_eq!(buffer.data_type(), DataType::Vec3);

        let handle = buffer.acquire(&backend).unwrap();
        assert_eq!(block.buffer(), Some(handle));
        assert_eq!(block.ref_count(), 1);
        assert!(SharedBuffer::in_block(block, 2).is_none());
    }
}
