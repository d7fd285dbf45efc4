//! The runtime object that wires a module to its host contexts.
//!
//! A [`Runtime`] owns the shared memory, the module, the channel the main context uses to reach
//! it, the task worker and the thread launcher. Nothing here is process-global: two runtimes in
//! one process are fully independent.
//!
//! Module-side behavior lives in [`ModuleHost`], which serves the buffer and call topics over a
//! channel. The host side is [`HostClient`], whose [`BufferRegistry`](tether_buffer::BufferRegistry)
//! turns returned descriptors into [`SharedBuffer`](tether_buffer::SharedBuffer) wrappers and
//! whose [`ChannelReleaser`] sends their release requests back.

pub mod calls;
mod client;
mod codec;
mod config;
mod error;
mod module_host;
mod runtime;
mod spawner;
pub mod topics;

pub use client::{CallArg, CallValue, ChannelReleaser, HostClient};
pub use config::{
    RuntimeConfig, ENV_DRAIN_POLL_MS, ENV_IDLE_WAIT_MS, ENV_MEMORY_BYTES, ENV_STRICT_LEDGER,
    ENV_TASK_QUEUE_BYTES, ENV_THREAD_STACK_SIZE, ENV_TLS_SIZE,
};
pub use error::{ConfigError, Result, RuntimeError};
pub use module_host::{CallContext, CallTable, ModuleFn, ModuleHost, ModuleValue, UNKNOWN_FUNCTION};
pub use runtime::{Runtime, WorkerContext, THREAD_SPAWN_FAILED};
pub use spawner::ThreadSpawner;
