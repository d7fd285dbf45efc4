use tether_mem::MemoryError;
use thiserror::Error;

use crate::element::ElementType;

pub type Result<T> = std::result::Result<T, BufferError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("view out of bounds (offset={offset}, len={len}, buffer span={span_start}+{span_len})")]
    OutOfBounds {
        offset: u32,
        len: u32,
        span_start: u32,
        span_len: u32,
    },

    #[error("view (offset={offset}, len={len}) is not aligned to {element_size}-byte elements")]
    Misaligned {
        offset: u32,
        len: u32,
        element_size: u32,
    },

    #[error(
        "only views spanning the entire buffer can be handed to the module (view={offset}+{len}, buffer span={span_start}+{span_len})"
    )]
    PartialView {
        offset: u32,
        len: u32,
        span_start: u32,
        span_len: u32,
    },

    #[error("view element type {found} does not match the buffer's recorded type {expected}; make an explicit copy to reinterpret")]
    TypeMismatch {
        expected: ElementType,
        found: ElementType,
    },

    #[error("buffer has already been transferred to the module")]
    Transferred,

    #[error("refcounted buffers are read-only")]
    ReadOnly,

    #[error("operation requires an exclusive buffer")]
    NotExclusive,

    #[error("buffer descriptor lies outside linear memory: {0}")]
    Memory(#[from] MemoryError),
}
