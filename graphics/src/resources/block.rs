//! Reference-counted GPU block.

use std::sync::Arc;

use bindery_core::{Block, BlockUsage, FieldInfo, PackingStandard, SharedSource};
use parking_lot::Mutex;

use crate::backend::{BackendError, BindingBackend, BufferDescriptor, BufferHandle, BufferUsage};

#[derive(Debug)]
struct BlockResource {
    block: Block,
    buffer: Option<BufferHandle>,
    refs: u32,
    last_update: Option<f64>,
}

/// A [`Block`] shared by every pipeline that binds it.
///
/// The GPU buffer is created by the first [`acquire`](Self::acquire) and
/// destroyed by the matching last [`release`](Self::release). Clones share the
/// same block.
///
/// # Example
///
/// ```ignore
/// let lights = SharedBlock::new(Block::new("lights", sources, PackingStandard::Std430, &caps)?);
/// let resources = PipelineResources::new().with_block("lights", lights.clone());
/// ```
#[derive(Debug, Clone)]
pub struct SharedBlock {
    inner: Arc<Mutex<BlockResource>>,
}

impl SharedBlock {
    pub fn new(block: Block) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BlockResource {
                block,
                buffer: None,
                refs: 0,
                last_update: None,
            })),
        }
    }

    /// Label of the underlying block.
    pub fn label(&self) -> String {
        self.inner.lock().block.label().to_string()
    }

    pub fn size(&self) -> u32 {
        self.inner.lock().block.size()
    }

    pub fn standard(&self) -> PackingStandard {
        self.inner.lock().block.standard()
    }

    pub fn usage(&self) -> BlockUsage {
        self.inner.lock().block.usage()
    }

    /// Placement of field `index`.
    pub fn field_info(&self, index: usize) -> Option<FieldInfo> {
        self.inner.lock().block.field_info(index).copied()
    }

    /// Source backing field `index`.
    pub fn source(&self, index: usize) -> Option<SharedSource> {
        self.inner.lock().block.source(index).cloned()
    }

    /// Run `f` on the underlying block.
    pub fn with_block<R>(&self, f: impl FnOnce(&Block) -> R) -> R {
        f(&self.inner.lock().block)
    }

    /// GPU buffer, present while at least one reference is held.
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.inner.lock().buffer
    }

    /// Number of holders.
    pub fn ref_count(&self) -> u32 {
        self.inner.lock().refs
    }

    /// Whether both handles share one block.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take a reference, creating and filling the GPU buffer on the first one.
    pub fn acquire(&self, backend: &dyn BindingBackend) -> Result<BufferHandle, BackendError> {
        let mut inner = self.inner.lock();
        if let Some(buffer) = inner.buffer {
            inner.refs += 1;
            return Ok(buffer);
        }

        let descriptor = BufferDescriptor::new(
            u64::from(inner.block.size().max(1)),
            BufferUsage::UNIFORM | BufferUsage::STORAGE | BufferUsage::VERTEX,
        )
        .with_label(inner.block.label())
        .with_dynamic(inner.block.usage() == BlockUsage::Dynamic);

        let buffer = backend.create_buffer(&descriptor)?;
        if let Err(err) = backend.write_buffer(buffer, 0, inner.block.data()) {
            backend.destroy_buffer(buffer);
            return Err(err);
        }
        inner.block.clear_dirty();
        inner.buffer = Some(buffer);
        inner.refs = 1;
        log::debug!("{}: allocated {} bytes", inner.block.label(), inner.block.size());
        Ok(buffer)
    }

    /// Drop a reference, destroying the GPU buffer with the last one.
    pub fn release(&self, backend: &dyn BindingBackend) {
        let mut inner = self.inner.lock();
        if inner.refs == 0 {
            return;
        }
        inner.refs -= 1;
        if inner.refs == 0 {
            if let Some(buffer) = inner.buffer.take() {
                backend.destroy_buffer(buffer);
            }
            inner.last_update = None;
            log::debug!("{}: released", inner.block.label());
        }
    }

    /// Advance the block to time `t` and upload it if it changed.
    ///
    /// Sources advance at most once per distinct `t`, however many pipelines
    /// share the block. A repeated `t` still picks up edits made in between.
    /// Returns whether an upload happened.
    pub fn update(&self, backend: &dyn BindingBackend, t: f64) -> Result<bool, BackendError> {
        let mut inner = self.inner.lock();
        if inner.last_update == Some(t) {
            inner.block.refresh_edited();
        } else {
            inner.last_update = Some(t);
            inner.block.update(t);
        }

        let Some(buffer) = inner.buffer else {
            return Ok(false);
        };
        if !inner.block.is_dirty() {
            return Ok(false);
        }
        backend.write_buffer(buffer, 0, inner.block.data())?;
        inner.block.clear_dirty();
        Ok(true)
    }
}

static_assertions::assert_impl_all!(SharedBlock: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use bindery_core::source::share;
    use bindery_core::{DeviceCapabilities, UniformValue, Value};
    use parking_lot::RwLock;

    fn block() -> SharedBlock {
        let value = share(UniformValue::animated(Value::Float(0.0), |t| {
            Value::Float(t as f32)
        }));
        SharedBlock::new(
            Block::new(
                "time",
                vec![value],
                PackingStandard::Std140,
                &DeviceCapabilities::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_refcount_allocates_once() {
        let backend = DummyBackend::new();
        let block = block();

        let a = block.acquire(&backend).unwrap();
        let b = block.acquire(&backend).unwrap();
        assert_eq!(a, b);
        assert_eq!(block.ref_count(), 2);
        assert_eq!(backend.stats().buffers_created, 1);

        block.release(&backend);
        assert!(block.buffer().is_some());
        block.release(&backend);
        assert!(block.buffer().is_none());
        assert_eq!(backend.stats().buffers_destroyed, 1);

        block.release(&backend);
        assert_eq!(backend.stats().buffers_destroyed, 1);
    }

    #[test]
    fn test_update_once_per_time() {
        let backend = DummyBackend::new();
        let block = block();
        let buffer = block.acquire(&backend).unwrap();
        let writes = backend.stats().buffer_writes;

        assert!(block.update(&backend, 1.0).unwrap());
        assert!(!block.update(&backend, 1.0).unwrap());
        assert_eq!(backend.stats().buffer_writes, writes + 1);

        assert!(block.update(&backend, 2.0).unwrap());
        let contents = backend.buffer_contents(buffer).unwrap();
        assert_eq!(&contents[..4], &2.0f32.to_ne_bytes());
    }

    #[test]
    fn test_edit_between_updates_at_same_time() {
        let backend = DummyBackend::new();
        let tint = Arc::new(RwLock::new(UniformValue::new(Value::Float(1.0))));
        let source: SharedSource = tint.clone();
        let block = SharedBlock::new(
            Block::new(
                "tint",
                vec![source],
                PackingStandard::Std140,
                &DeviceCapabilities::default(),
            )
            .unwrap(),
        );
        let buffer = block.acquire(&backend).unwrap();

        block.update(&backend, 0.0).unwrap();
        tint.write().set(Value::Float(5.0)).unwrap();
        assert!(block.update(&backend, 0.0).unwrap());
        let contents = backend.buffer_contents(buffer).unwrap();
        assert_eq!(&contents[..4], &5.0f32.to_ne_bytes());
        assert!(!block.update(&backend, 0.0).unwrap());
    }

    #[test]
    fn test_update_without_buffer_only_refreshes() {
        let backend = DummyBackend::new();
        let block = block();
        assert!(!block.update(&backend, 3.0).unwrap());
        assert_eq!(backend.stats().buffer_writes, 0);
        block.with_block(|b| assert!(b.is_dirty()));
    }
}
