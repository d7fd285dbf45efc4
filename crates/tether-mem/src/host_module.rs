//! In-process stand-in for the compiled module.
//!
//! Host builds (tests, the CLI, native embedders) have no wasm instance to call into, so
//! [`HostModule`] implements the module entry points directly on top of a [`LinearMemory`]:
//! - the lowest [`NULL_GUARD_BYTES`] are never handed out, so offset 0 stays a null pointer;
//! - the main execution context's stack sits right above the guard;
//! - everything after that is a first-fit heap (`linked_list_allocator`) that serves messages,
//!   vectors, refcount cells, thread regions and function contexts.
//!
//! Refcount cells store their strong count in linear memory, like `Arc` does inside a real
//! module, so the count can also be observed by other contexts.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use linked_list_allocator::Heap;

use crate::error::{MemoryError, ModuleError};
use crate::memory::LinearMemory;
use crate::module::{ModuleAllocator, ModuleInstance, RefHandle};

pub const NULL_GUARD_BYTES: u32 = 64;

/// Stack reserved for the main execution context.
pub const MAIN_STACK_BYTES: u32 = 64 * 1024;

/// Every heap allocation is aligned to 64 bits.
pub const ALLOC_ALIGN: usize = 8;

const ARC_CELL_BYTES: u32 = 16;
const FUNCTION_CONTEXT_BYTES: u32 = 8;

type ThreadFn = Box<dyn FnOnce(&mut HostInstance) + Send>;

pub struct HostModule {
    memory: LinearMemory,
    heap: Mutex<HostHeap>,
    arcs: Mutex<HashMap<RefHandle, ArcVec>>,
    functions: Mutex<HashMap<u32, ThreadFn>>,
    tls_size: u32,
    main_stack_top: u32,
}

#[derive(Debug, Clone, Copy)]
struct ArcVec {
    vec_ptr: u32,
    len: u32,
}

struct HostHeap {
    heap: Heap,
    base: *mut u8,
    live: HashMap<u32, Layout>,
}

// `base` points into the `LinearMemory` owned by the same `HostModule`.
unsafe impl Send for HostHeap {}

impl HostHeap {
    fn alloc(&mut self, bytes: u32) -> Result<u32, ModuleError> {
        let len = bytes as usize;
        let layout = Layout::from_size_align(len.max(1), ALLOC_ALIGN)
            .map_err(|_| MemoryError::OutOfMemory { len })?;
        let ptr = self
            .heap
            .allocate_first_fit(layout)
            .map_err(|()| MemoryError::OutOfMemory { len })?;
        let offset = (ptr.as_ptr() as usize - self.base as usize) as u32;
        self.live.insert(offset, layout);
        Ok(offset)
    }

    fn dealloc(&mut self, offset: u32) -> Result<(), ModuleError> {
        let layout = self
            .live
            .remove(&offset)
            .ok_or(ModuleError::InvalidFree(offset))?;
        unsafe {
            let ptr = NonNull::new_unchecked(self.base.add(offset as usize));
            self.heap.deallocate(ptr, layout);
        }
        Ok(())
    }

    fn size_of(&self, offset: u32) -> Option<usize> {
        self.live.get(&offset).map(Layout::size)
    }
}

impl HostModule {
    pub fn new(memory: LinearMemory, tls_size: u32) -> Result<Arc<Self>, ModuleError> {
        let heap_start = (NULL_GUARD_BYTES + MAIN_STACK_BYTES) as usize;
        // Leave room for at least one page of heap.
        let required = heap_start + 64 * 1024;
        if memory.len() < required {
            return Err(ModuleError::MemoryTooSmall {
                memory_len: memory.len(),
                required,
            });
        }

        let base = memory.base_ptr();
        let mut heap = Heap::empty();
        unsafe { heap.init(base.add(heap_start), memory.len() - heap_start) };

        Ok(Arc::new(Self {
            memory,
            heap: Mutex::new(HostHeap {
                heap,
                base,
                live: HashMap::new(),
            }),
            arcs: Mutex::new(HashMap::new()),
            functions: Mutex::new(HashMap::new()),
            tls_size,
            main_stack_top: heap_start as u32,
        }))
    }

    /// Instance for the main execution context, which already owns a stack.
    pub fn main_instance(self: &Arc<Self>) -> HostInstance {
        HostInstance {
            module: self.clone(),
            stack_pointer: self.main_stack_top,
            tls_base: None,
        }
    }

    /// Fresh instance for a newly spawned execution context; it has neither a stack nor
    /// thread-local storage until bootstrapped.
    pub fn new_instance(self: &Arc<Self>) -> HostInstance {
        HostInstance {
            module: self.clone(),
            stack_pointer: 0,
            tls_base: None,
        }
    }

    /// Register a closure to be run by [`ModuleInstance::run_function_pointer`].
    ///
    /// The returned context pointer is consumed by the first run.
    pub fn register_function(
        &self,
        f: impl FnOnce(&mut HostInstance) + Send + 'static,
    ) -> Result<u32, ModuleError> {
        let ctx_ptr = self.alloc_message(FUNCTION_CONTEXT_BYTES)?;
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ctx_ptr, Box::new(f));
        Ok(ctx_ptr)
    }

    /// Current strong count of a refcounted allocation, if it is still alive.
    pub fn arc_count(&self, handle: RefHandle) -> Option<u32> {
        if !self.arcs().contains_key(&handle) {
            return None;
        }
        self.memory
            .atomic_u32(handle.0)
            .ok()
            .map(|count| count.load(Ordering::SeqCst))
    }

    /// `(ptr, len)` of the vector owned by a refcounted allocation.
    pub fn arc_data(&self, handle: RefHandle) -> Option<(u32, u32)> {
        self.arcs().get(&handle).map(|arc| (arc.vec_ptr, arc.len))
    }

    pub fn is_live_allocation(&self, ptr: u32) -> bool {
        self.heap().live.contains_key(&ptr)
    }

    pub fn live_allocations(&self) -> usize {
        self.heap().live.len()
    }

    fn heap(&self) -> std::sync::MutexGuard<'_, HostHeap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arcs(&self) -> std::sync::MutexGuard<'_, HashMap<RefHandle, ArcVec>> {
        self.arcs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ModuleAllocator for HostModule {
    fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    fn alloc_message(&self, bytes: u32) -> Result<u32, ModuleError> {
        self.heap().alloc(bytes)
    }

    fn realloc_message(&self, ptr: u32, new_bytes: u32) -> Result<u32, ModuleError> {
        let mut heap = self.heap();
        let old_len = heap.size_of(ptr).ok_or(ModuleError::InvalidFree(ptr))?;
        let new_ptr = heap.alloc(new_bytes)?;
        self.memory
            .copy_within(ptr, new_ptr, old_len.min(new_bytes as usize))?;
        heap.dealloc(ptr)?;
        Ok(new_ptr)
    }

    fn dealloc_message(&self, ptr: u32) -> Result<(), ModuleError> {
        self.heap().dealloc(ptr)
    }

    fn alloc_vec(&self, bytes: u32) -> Result<u32, ModuleError> {
        self.heap().alloc(bytes)
    }

    fn dealloc_vec(&self, ptr: u32, _len: u32, _capacity: u32) -> Result<(), ModuleError> {
        self.heap().dealloc(ptr)
    }

    fn create_arc_vec(&self, vec_ptr: u32, len: u32) -> Result<RefHandle, ModuleError> {
        let cell = {
            let mut heap = self.heap();
            if !heap.live.contains_key(&vec_ptr) {
                return Err(ModuleError::InvalidFree(vec_ptr));
            }
            heap.alloc(ARC_CELL_BYTES)?
        };
        self.memory.atomic_u32(cell)?.store(1, Ordering::SeqCst);
        let handle = RefHandle(cell);
        self.arcs().insert(handle, ArcVec { vec_ptr, len });
        Ok(handle)
    }

    fn increment_arc(&self, handle: RefHandle) -> Result<(), ModuleError> {
        let arcs = self.arcs();
        if !arcs.contains_key(&handle) {
            return Err(ModuleError::UnknownRefHandle(handle));
        }
        self.memory.atomic_u32(handle.0)?.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn decrement_arc(&self, handle: RefHandle) -> Result<(), ModuleError> {
        let mut arcs = self.arcs();
        let Some(arc) = arcs.get(&handle).copied() else {
            return Err(ModuleError::UnknownRefHandle(handle));
        };
        let prev = self.memory.atomic_u32(handle.0)?.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            arcs.remove(&handle);
            drop(arcs);
            let mut heap = self.heap();
            heap.dealloc(arc.vec_ptr)?;
            heap.dealloc(handle.0)?;
        }
        Ok(())
    }

    fn tls_size(&self) -> u32 {
        self.tls_size
    }
}

/// One instantiation of the [`HostModule`] in a particular execution context.
pub struct HostInstance {
    module: Arc<HostModule>,
    stack_pointer: u32,
    tls_base: Option<u32>,
}

impl HostInstance {
    pub fn module(&self) -> &Arc<HostModule> {
        &self.module
    }

    pub fn tls_base(&self) -> Option<u32> {
        self.tls_base
    }
}

impl ModuleInstance for HostInstance {
    fn init_tls(&mut self, tls_base: u32) -> Result<(), ModuleError> {
        if self.tls_base.is_some() {
            return Err(ModuleError::TlsAlreadyInitialized);
        }
        // Fresh TLS blocks start zeroed (the `.tbss` template).
        let zeroes = vec![0u8; self.module.tls_size as usize];
        self.module.memory.write(tls_base, &zeroes)?;
        self.tls_base = Some(tls_base);
        Ok(())
    }

    fn set_stack_pointer(&mut self, stack_pointer: u32) {
        self.stack_pointer = stack_pointer;
    }

    fn stack_pointer(&self) -> u32 {
        self.stack_pointer
    }

    fn run_function_pointer(&mut self, ctx_ptr: u32) -> Result<(), ModuleError> {
        if self.tls_base.is_none() {
            return Err(ModuleError::TlsNotInitialized);
        }
        let f = self
            .module
            .functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ctx_ptr)
            .ok_or(ModuleError::UnknownFunction(ctx_ptr))?;
        self.module.dealloc_message(ctx_ptr)?;
        f(self);
        Ok(())
    }
}
