use tether_ipc::DecodeError;
use tether_mem::{MemoryError, ModuleError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue is full ({capacity} items)")]
    QueueFull { capacity: u32 },

    #[error("unlock of a mutex that is not locked")]
    MutexNotLocked,

    #[error("invalid work queue layout: {0}")]
    InvalidLayout(&'static str),

    #[error("return value {0} is reserved as the initial value")]
    InitialReturnValue(i32),

    #[error("timed out waiting for a return value")]
    TimedOut,

    #[error("task failed on the worker")]
    TaskFailed,

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("malformed task message: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to start task worker: {0}")]
    Spawn(#[from] std::io::Error),
}
