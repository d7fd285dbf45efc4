//! Shared-memory work queue and the helper context that drains it.
//!
//! Contexts that cannot receive messages (they block in the module) still need asynchronous
//! I/O. They serialize a [`TaskMessage`] into module memory, push its address onto a
//! [`WorkQueue`] and block on an `i32` return word; a [`TaskWorker`] running on its own thread
//! drains the queue, performs the I/O on a single-threaded tokio runtime and writes results
//! straight into shared memory.

mod client;
mod error;
pub mod layout;
mod message;
pub mod mutex;
mod queue;
mod retval;
pub mod source;
mod stream;
mod worker;

pub use client::TaskClient;
pub use error::{QueueError, Result};
pub use message::{StreamRequest, TaskMessage};
pub use mutex::ShmMutex;
pub use queue::WorkQueue;
pub use retval::{send_i32_return_value, wait_for_return_value, RETURN_ERROR, RETURN_INITIAL};
pub use source::{MemorySource, SourceError, StreamSource};
pub use worker::{DrainMode, TaskWorker, TaskWorkerConfig};
