use tether_buffer::BufferError;
use tether_ipc::{ChannelError, DecodeError};
use tether_mem::{MemoryError, ModuleError};
use tether_taskq::QueueError;
use tether_thread::BootstrapError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("malformed reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("arguments {first} and {second} are the same exclusive buffer")]
    DuplicateBufferArgument { first: usize, second: usize },

    #[error("runtime must be started from within a tokio runtime")]
    NoRuntime,
}
