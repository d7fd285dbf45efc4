//! Per-thread storage for execution contexts that share one linear memory.
//!
//! Each context needs its own thread-local storage block and call stack inside the shared
//! memory before it may run module code. The protocol has two halves:
//! - an already-initialized context allocates the region ([`InitializedThread::allocate_for_spawn`]);
//! - the new context adopts it ([`ThreadRegion::initialize_on_new_thread`]).
//!
//! Only an [`InitializedThread`] can allocate, because the module allocator itself depends on
//! thread-local state. Regions are never reclaimed when a thread exits.

mod bootstrap;
mod error;
mod launcher;

pub use bootstrap::{
    region_size, BootstrapState, InitializedThread, ThreadRegion, DEFAULT_STACK_SIZE,
    REGION_ALIGN,
};
pub use error::{BootstrapError, Result};
pub use launcher::{SpawnRequest, StdThreadLauncher, ThreadLauncher};
