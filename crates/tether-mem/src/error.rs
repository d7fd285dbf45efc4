use thiserror::Error;

use crate::module::RefHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("linear memory access out of bounds (ptr={ptr:#x}, len={len}, memory_len={memory_len})")]
    OutOfBounds {
        ptr: u32,
        len: usize,
        memory_len: usize,
    },

    #[error("misaligned atomic access at {ptr:#x} (required alignment {align})")]
    Misaligned { ptr: u32, align: u32 },

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("linear memory size {0} is not between 1 and 4294967295 bytes")]
    InvalidSize(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("free of pointer {0:#x} that is not a live allocation")]
    InvalidFree(u32),

    #[error("unknown refcounted allocation {0}")]
    UnknownRefHandle(RefHandle),

    #[error("no function registered for context pointer {0:#x}")]
    UnknownFunction(u32),

    #[error("thread-local storage has already been initialized for this instance")]
    TlsAlreadyInitialized,

    #[error("thread-local storage is not initialized for this instance")]
    TlsNotInitialized,

    #[error("linear memory of {memory_len} bytes is too small for the module layout ({required} bytes required)")]
    MemoryTooSmall { memory_len: usize, required: usize },
}
