use core::fmt;
use core::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tether_mem::{LinearMemory, RefHandle};

use crate::element::ElementType;
use crate::error::{BufferError, Result};
use crate::registry::{BufferReleaser, RegistryShared};

/// Who is responsible for freeing a buffer's backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// A module vector owned by exactly one host wrapper. Its capacity is needed to free it.
    Exclusive { capacity: u32 },
    /// An immutable allocation whose lifetime is governed by a module-side refcount.
    SharedRefcounted { handle: RefHandle },
}

/// Span of linear memory plus its ownership tag, as exchanged with the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub ptr: u32,
    pub len: u32,
    pub ownership: Ownership,
}

impl BufferDescriptor {
    pub fn exclusive(ptr: u32, len: u32, capacity: u32) -> Self {
        Self {
            ptr,
            len,
            ownership: Ownership::Exclusive { capacity },
        }
    }

    pub fn refcounted(ptr: u32, len: u32, handle: RefHandle) -> Self {
        Self {
            ptr,
            len,
            ownership: Ownership::SharedRefcounted { handle },
        }
    }

    pub fn ref_handle(&self) -> Option<RefHandle> {
        match self.ownership {
            Ownership::SharedRefcounted { handle } => Some(handle),
            Ownership::Exclusive { .. } => None,
        }
    }
}

/// Release action attached to a wrapper. Taken exactly once: either by the final drop or, for
/// exclusive buffers, by a transfer back to the module.
pub(crate) struct Finalizer {
    pub(crate) releaser: Arc<dyn BufferReleaser>,
    pub(crate) registry: Weak<RegistryShared>,
}

pub(crate) struct BufferInner {
    memory: LinearMemory,
    descriptor: BufferDescriptor,
    element_type: ElementType,
    transferred: AtomicBool,
    finalizer: Mutex<Option<Finalizer>>,
}

impl BufferInner {
    fn finalizer(&self) -> MutexGuard<'_, Option<Finalizer>> {
        self.finalizer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let finalizer = self
            .finalizer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(finalizer) = finalizer else {
            return;
        };

        if let Some(registry) = finalizer.registry.upgrade() {
            registry.on_unreachable(self as *const BufferInner, &self.descriptor);
        }
        match self.descriptor.ownership {
            Ownership::SharedRefcounted { handle } => finalizer.releaser.decrement_ref(handle),
            Ownership::Exclusive { .. } => finalizer.releaser.dealloc_exclusive(&self.descriptor),
        }
    }
}

/// Host-side wrapper for a span of module memory.
///
/// Clones share one wrapper; the release action runs when the last clone is dropped.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<BufferInner>,
}

impl SharedBuffer {
    pub(crate) fn new(
        memory: LinearMemory,
        descriptor: BufferDescriptor,
        element_type: ElementType,
        finalizer: Finalizer,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                memory,
                descriptor,
                element_type,
                transferred: AtomicBool::new(false),
                finalizer: Mutex::new(Some(finalizer)),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<BufferInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<BufferInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        self.inner.descriptor
    }

    pub fn ptr(&self) -> u32 {
        self.inner.descriptor.ptr
    }

    pub fn len(&self) -> u32 {
        self.inner.descriptor.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ownership(&self) -> Ownership {
        self.inner.descriptor.ownership
    }

    pub fn element_type(&self) -> ElementType {
        self.inner.element_type
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.inner.memory
    }

    /// Whether the buffer has been handed back to the module. Only exclusive buffers can be.
    pub fn is_transferred(&self) -> bool {
        self.inner.transferred.load(Ordering::Acquire)
    }

    /// Whether `self` and `other` are clones of the same wrapper.
    pub fn same_buffer(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// View of the whole buffer with its recorded element type.
    pub fn view(&self) -> BufferView {
        BufferView {
            buffer: self.clone(),
            offset: self.ptr(),
            len: self.len(),
            element_type: self.element_type(),
        }
    }

    /// View of the whole buffer reinterpreted as `element_type`.
    pub fn view_as(&self, element_type: ElementType) -> Result<BufferView> {
        BufferView::wrap(self, self.ptr(), self.len(), element_type)
    }

    /// Copy the contents out. The copy is independent of the buffer's lifetime.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.view().to_vec()
    }

    /// Overwrite bytes starting at `offset` (relative to the buffer start).
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        if let Ownership::SharedRefcounted { .. } = self.ownership() {
            return Err(BufferError::ReadOnly);
        }
        let end = u64::from(offset) + data.len() as u64;
        if end > u64::from(self.len()) {
            return Err(BufferError::OutOfBounds {
                offset: self.ptr().saturating_add(offset),
                len: data.len() as u32,
                span_start: self.ptr(),
                span_len: self.len(),
            });
        }
        self.inner.memory.write(self.ptr() + offset, data)?;
        Ok(())
    }

    /// Hand the whole buffer to the module. See [`BufferView::transfer`].
    pub fn transfer(&self) -> Result<BufferDescriptor> {
        self.view().transfer()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_transferred() {
            return Err(BufferError::Transferred);
        }
        Ok(())
    }

    /// Give up host ownership of an exclusive buffer without running its destructor.
    pub(crate) fn detach_exclusive(&self) -> Result<BufferDescriptor> {
        if !matches!(self.ownership(), Ownership::Exclusive { .. }) {
            return Err(BufferError::NotExclusive);
        }
        let finalizer = self.inner.finalizer().take();
        let Some(finalizer) = finalizer else {
            return Err(BufferError::Transferred);
        };
        self.inner.transferred.store(true, Ordering::Release);
        if let Some(registry) = finalizer.registry.upgrade() {
            registry.on_transferred(&self.inner.descriptor);
        }
        Ok(self.inner.descriptor)
    }

    fn share_refcounted(&self, handle: RefHandle) -> Result<BufferDescriptor> {
        let releaser = self
            .inner
            .finalizer()
            .as_ref()
            .map(|finalizer| finalizer.releaser.clone());
        // A refcounted wrapper only loses its finalizer while it is being dropped.
        let Some(releaser) = releaser else {
            return Err(BufferError::Transferred);
        };
        releaser.increment_ref(handle, self.clone());
        Ok(self.inner.descriptor)
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("descriptor", &self.inner.descriptor)
            .field("element_type", &self.inner.element_type)
            .field("transferred", &self.is_transferred())
            .finish()
    }
}

/// Typed window onto part of a [`SharedBuffer`].
///
/// Offsets are absolute linear-memory offsets. A view keeps its buffer alive.
#[derive(Debug, Clone)]
pub struct BufferView {
    buffer: SharedBuffer,
    offset: u32,
    len: u32,
    element_type: ElementType,
}

impl BufferView {
    /// Wrap `len` bytes at memory offset `offset`, which must lie inside `buffer`.
    pub fn wrap(
        buffer: &SharedBuffer,
        offset: u32,
        len: u32,
        element_type: ElementType,
    ) -> Result<Self> {
        let start = u64::from(buffer.ptr());
        let end = start + u64::from(buffer.len());
        if u64::from(offset) < start || u64::from(offset) + u64::from(len) > end {
            return Err(BufferError::OutOfBounds {
                offset,
                len,
                span_start: buffer.ptr(),
                span_len: buffer.len(),
            });
        }
        let element_size = element_type.byte_size();
        if offset % element_size != 0 || len % element_size != 0 {
            return Err(BufferError::Misaligned {
                offset,
                len,
                element_size,
            });
        }
        Ok(Self {
            buffer: buffer.clone(),
            offset,
            len,
            element_type,
        })
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn byte_offset(&self) -> u32 {
        self.offset
    }

    pub fn byte_len(&self) -> u32 {
        self.len
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn element_count(&self) -> u32 {
        self.len / self.element_type.byte_size()
    }

    /// Narrow the view to the element range `elements`.
    pub fn subview(&self, elements: Range<u32>) -> Result<Self> {
        let size = self.element_type.byte_size();
        if elements.start > elements.end || elements.end > self.element_count() {
            return Err(BufferError::OutOfBounds {
                offset: self.offset.saturating_add(elements.start.saturating_mul(size)),
                len: elements.end.saturating_sub(elements.start).saturating_mul(size),
                span_start: self.offset,
                span_len: self.len,
            });
        }
        Ok(Self {
            buffer: self.buffer.clone(),
            offset: self.offset + elements.start * size,
            len: (elements.end - elements.start) * size,
            element_type: self.element_type,
        })
    }

    /// Fails with [`BufferError::PartialView`] unless the view spans its entire buffer.
    pub fn covers_whole(&self) -> Result<()> {
        if self.offset != self.buffer.ptr() || self.len != self.buffer.len() {
            return Err(BufferError::PartialView {
                offset: self.offset,
                len: self.len,
                span_start: self.buffer.ptr(),
                span_len: self.buffer.len(),
            });
        }
        Ok(())
    }

    /// Fails with [`BufferError::TypeMismatch`] if the view reinterprets the buffer.
    pub fn validate_type_tag(&self) -> Result<()> {
        if self.element_type != self.buffer.element_type() {
            return Err(BufferError::TypeMismatch {
                expected: self.buffer.element_type(),
                found: self.element_type,
            });
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.buffer.ensure_live()?;
        Ok(self.buffer.memory().read_vec(self.offset, self.len as usize)?)
    }

    /// Prepare the view's buffer for handing to the module and return the descriptor to send.
    ///
    /// - Exclusive buffers are unregistered first and never destroyed by the host afterwards;
    ///   every other clone of the wrapper reports [`BufferError::Transferred`] from then on.
    /// - Refcounted buffers get one extra module-side reference. The wrapper is kept alive by
    ///   the releaser until that increment has been applied.
    pub fn transfer(self) -> Result<BufferDescriptor> {
        self.covers_whole()?;
        self.validate_type_tag()?;
        self.buffer.ensure_live()?;
        match self.buffer.ownership() {
            Ownership::Exclusive { .. } => self.buffer.detach_exclusive(),
            Ownership::SharedRefcounted { handle } => self.buffer.share_refcounted(handle),
        }
    }
}
