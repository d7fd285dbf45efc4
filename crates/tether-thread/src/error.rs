use tether_mem::ModuleError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BootstrapError>;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("thread region of {tls_size} TLS bytes plus a {stack_size}-byte stack does not fit in 32 bits")]
    RegionTooLarge { tls_size: u32, stack_size: u32 },

    #[error("stack size {0} is too small to hold the initial frame")]
    StackTooSmall(u32),

    #[error("thread region at {ptr:#x} of {size} bytes cannot hold {tls_size} TLS bytes and a stack")]
    InvalidRegion { ptr: u32, size: u32, tls_size: u32 },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("failed to start thread: {0}")]
    Spawn(#[from] std::io::Error),
}
