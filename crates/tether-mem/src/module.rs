//! Entry points the runtime consumes from the compiled module.
//!
//! [`ModuleAllocator`] covers the operations that act on the shared heap and may be called from
//! any initialized execution context. [`ModuleInstance`] covers per-context state (thread-local
//! storage, stack pointer, function dispatch), one value per instantiation of the module.

use core::fmt;

use crate::error::ModuleError;
use crate::memory::LinearMemory;

/// Opaque handle naming a refcounted allocation on the module side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefHandle(pub u32);

impl fmt::Display for RefHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub trait ModuleAllocator: Send + Sync {
    fn memory(&self) -> &LinearMemory;

    /// Allocate a message buffer. Messages are always 8-byte aligned.
    fn alloc_message(&self, bytes: u32) -> Result<u32, ModuleError>;

    fn realloc_message(&self, ptr: u32, new_bytes: u32) -> Result<u32, ModuleError>;

    fn dealloc_message(&self, ptr: u32) -> Result<(), ModuleError>;

    /// Allocate the backing store of a vector of `bytes` bytes.
    fn alloc_vec(&self, bytes: u32) -> Result<u32, ModuleError>;

    fn dealloc_vec(&self, ptr: u32, len: u32, capacity: u32) -> Result<(), ModuleError>;

    /// Move a vector into a new refcounted allocation with a count of 1.
    fn create_arc_vec(&self, vec_ptr: u32, len: u32) -> Result<RefHandle, ModuleError>;

    fn increment_arc(&self, handle: RefHandle) -> Result<(), ModuleError>;

    /// Drop one reference; the allocation is freed when the count reaches zero.
    fn decrement_arc(&self, handle: RefHandle) -> Result<(), ModuleError>;

    /// Size in bytes of one thread-local storage block.
    fn tls_size(&self) -> u32;
}

pub trait ModuleInstance: Send {
    /// Initialize thread-local storage at `tls_base`. Called exactly once per instance.
    fn init_tls(&mut self, tls_base: u32) -> Result<(), ModuleError>;

    fn set_stack_pointer(&mut self, stack_pointer: u32);

    fn stack_pointer(&self) -> u32;

    /// Run the closure identified by `ctx_ptr` on this instance.
    fn run_function_pointer(&mut self, ctx_ptr: u32) -> Result<(), ModuleError>;
}
