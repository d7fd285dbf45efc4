use core::ptr;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tether_mem::{LinearMemory, ModuleAllocator, RefHandle};

use crate::buffer::{BufferDescriptor, BufferInner, Finalizer, Ownership, SharedBuffer};
use crate::element::ElementType;
use crate::error::Result;
use crate::ledger::{AllocationLedger, ExclusiveState};

/// Performs the module-side half of buffer ownership changes.
///
/// Called from wrapper drops, so implementations must not block on the dropping context and
/// cannot report failures to a caller; they log instead.
pub trait BufferReleaser: Send + Sync {
    /// Add one module reference to `handle`. `keepalive` must be held until the increment has
    /// been applied so the count never touches zero in between.
    fn increment_ref(&self, handle: RefHandle, keepalive: SharedBuffer);

    fn decrement_ref(&self, handle: RefHandle);

    /// Free an exclusive vector the host still owns.
    fn dealloc_exclusive(&self, descriptor: &BufferDescriptor);
}

/// Releaser for contexts that can call the module allocator directly.
pub struct DirectReleaser {
    module: Arc<dyn ModuleAllocator>,
}

impl DirectReleaser {
    pub fn new(module: Arc<dyn ModuleAllocator>) -> Self {
        Self { module }
    }
}

impl BufferReleaser for DirectReleaser {
    fn increment_ref(&self, handle: RefHandle, keepalive: SharedBuffer) {
        if let Err(err) = self.module.increment_arc(handle) {
            tracing::error!(%handle, %err, "failed to add module reference");
        }
        drop(keepalive);
    }

    fn decrement_ref(&self, handle: RefHandle) {
        if let Err(err) = self.module.decrement_arc(handle) {
            tracing::error!(%handle, %err, "failed to drop module reference");
        }
    }

    fn dealloc_exclusive(&self, descriptor: &BufferDescriptor) {
        let Ownership::Exclusive { capacity } = descriptor.ownership else {
            return;
        };
        if let Err(err) = self
            .module
            .dealloc_vec(descriptor.ptr, descriptor.len, capacity)
        {
            tracing::error!(ptr = descriptor.ptr, %err, "failed to free exclusive buffer");
        }
    }
}

pub(crate) struct RegistryShared {
    memory: LinearMemory,
    releaser: Arc<dyn BufferReleaser>,
    cache: Mutex<HashMap<RefHandle, Weak<BufferInner>>>,
    ledger: Option<AllocationLedger>,
}

impl RegistryShared {
    fn cache(&self) -> MutexGuard<'_, HashMap<RefHandle, Weak<BufferInner>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called from the final drop of `inner`, before its release action runs.
    pub(crate) fn on_unreachable(&self, inner: *const BufferInner, descriptor: &BufferDescriptor) {
        match descriptor.ownership {
            Ownership::SharedRefcounted { handle } => {
                {
                    let mut cache = self.cache();
                    // A newer wrapper may already have replaced this one.
                    if cache
                        .get(&handle)
                        .is_some_and(|entry| ptr::eq(entry.as_ptr(), inner))
                    {
                        cache.remove(&handle);
                    }
                }
                if let Some(ledger) = &self.ledger {
                    ledger.ref_released(handle);
                }
            }
            Ownership::Exclusive { .. } => {
                if let Some(ledger) = &self.ledger {
                    ledger.exclusive_released(descriptor.ptr, ExclusiveState::Destroyed);
                }
            }
        }
    }

    pub(crate) fn on_transferred(&self, descriptor: &BufferDescriptor) {
        if let Some(ledger) = &self.ledger {
            ledger.exclusive_released(descriptor.ptr, ExclusiveState::Transferred);
        }
    }
}

/// Creates host wrappers for module buffers and deduplicates refcounted ones.
///
/// At most one live wrapper exists per [`RefHandle`]; the cache holds weak references, so it
/// never keeps a buffer alive by itself.
#[derive(Clone)]
pub struct BufferRegistry {
    shared: Arc<RegistryShared>,
}

impl BufferRegistry {
    /// Registry whose strict-mode ledger is enabled in debug builds.
    pub fn new(memory: LinearMemory, releaser: Arc<dyn BufferReleaser>) -> Self {
        Self::with_strict(memory, releaser, cfg!(debug_assertions))
    }

    pub fn with_strict(
        memory: LinearMemory,
        releaser: Arc<dyn BufferReleaser>,
        strict: bool,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                memory,
                releaser,
                cache: Mutex::new(HashMap::new()),
                ledger: strict.then(AllocationLedger::new),
            }),
        }
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.shared.memory
    }

    pub fn ledger(&self) -> Option<&AllocationLedger> {
        self.shared.ledger.as_ref()
    }

    /// The live wrapper for `handle`, if any.
    pub fn resolve(&self, handle: RefHandle) -> Option<SharedBuffer> {
        let inner = self.shared.cache().get(&handle).and_then(Weak::upgrade);
        inner.map(SharedBuffer::from_inner)
    }

    /// Number of handles with a cache entry, including entries whose wrapper is being dropped.
    pub fn cached_handles(&self) -> usize {
        self.shared.cache().len()
    }

    /// Wrap a refcounted allocation the host now holds one module reference to.
    ///
    /// Same as [`BufferRegistry::reclaim`]: a live wrapper for `handle` is returned instead and
    /// the extra reference dropped.
    pub fn register_refcounted(
        &self,
        ptr: u32,
        len: u32,
        handle: RefHandle,
        element_type: ElementType,
    ) -> Result<SharedBuffer> {
        self.reclaim(BufferDescriptor::refcounted(ptr, len, handle), element_type)
    }

    /// Wrap an exclusive vector now owned by the host.
    pub fn register_exclusive(
        &self,
        ptr: u32,
        len: u32,
        capacity: u32,
        element_type: ElementType,
    ) -> Result<SharedBuffer> {
        self.shared.memory.check_range(ptr, len as usize)?;
        if let Some(ledger) = &self.shared.ledger {
            ledger.exclusive_allocated(ptr);
        }
        Ok(SharedBuffer::new(
            self.shared.memory.clone(),
            BufferDescriptor::exclusive(ptr, len, capacity),
            element_type,
            self.finalizer(),
        ))
    }

    /// Detach an exclusive buffer so that dropping it no longer frees the memory.
    pub fn unregister(&self, buffer: &SharedBuffer) -> Result<BufferDescriptor> {
        buffer.detach_exclusive()
    }

    /// Take ownership of a buffer the module handed to the host.
    ///
    /// If a live wrapper already exists for a refcounted handle, the module reference carried by
    /// `descriptor` is redundant: it is dropped immediately and the existing wrapper returned.
    pub fn reclaim(
        &self,
        descriptor: BufferDescriptor,
        element_type: ElementType,
    ) -> Result<SharedBuffer> {
        let handle = match descriptor.ownership {
            Ownership::Exclusive { capacity } => {
                return self.register_exclusive(
                    descriptor.ptr,
                    descriptor.len,
                    capacity,
                    element_type,
                );
            }
            Ownership::SharedRefcounted { handle } => handle,
        };

        let mut cache = self.shared.cache();
        if let Some(existing) = cache.get(&handle).and_then(Weak::upgrade) {
            drop(cache);
            tracing::trace!(%handle, "reusing live wrapper for refcounted buffer");
            self.shared.releaser.decrement_ref(handle);
            return Ok(SharedBuffer::from_inner(existing));
        }
        let buffer = self.new_refcounted(descriptor.ptr, descriptor.len, handle, element_type)?;
        cache.insert(handle, buffer.downgrade());
        drop(cache);
        Ok(buffer)
    }

    fn new_refcounted(
        &self,
        ptr: u32,
        len: u32,
        handle: RefHandle,
        element_type: ElementType,
    ) -> Result<SharedBuffer> {
        self.shared.memory.check_range(ptr, len as usize)?;
        if let Some(ledger) = &self.shared.ledger {
            ledger.ref_acquired(handle);
        }
        Ok(SharedBuffer::new(
            self.shared.memory.clone(),
            BufferDescriptor::refcounted(ptr, len, handle),
            element_type,
            self.finalizer(),
        ))
    }

    fn finalizer(&self) -> Finalizer {
        Finalizer {
            releaser: self.shared.releaser.clone(),
            registry: Arc::downgrade(&self.shared),
        }
    }
}

impl core::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("memory", &self.shared.memory)
            .field("cached_handles", &self.cached_handles())
            .field("strict", &self.shared.ledger.is_some())
            .finish()
    }
}
