//! Shared linear memory and the module entry points consumed by the runtime bridge.
//!
//! Every execution context (host, workers, the task helper) addresses the same [`LinearMemory`]
//! by 32-bit offsets, exactly like a wasm32 module instantiated with a shared memory. Host builds
//! back it with a heap allocation and emulate `Atomics.wait`/`Atomics.notify` with a parking
//! table; the algorithms layered on top are identical.

mod error;
pub mod host_module;
pub mod memory;
pub mod module;

pub use error::{MemoryError, ModuleError};
pub use host_module::{HostInstance, HostModule};
pub use memory::{LinearMemory, WaitOutcome};
pub use module::{ModuleAllocator, ModuleInstance, RefHandle};
