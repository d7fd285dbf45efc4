//! Ownership-tagged buffers over shared linear memory.
//!
//! A [`SharedBuffer`] is the host-side wrapper for a span of module memory. It is either
//! [`Ownership::Exclusive`] (a mutable vector the host owns until it hands it back) or
//! [`Ownership::SharedRefcounted`] (an immutable allocation kept alive by a module-side refcount).
//! All ownership transitions live in this crate:
//! - creation and deduplication go through [`BufferRegistry`];
//! - handing a buffer to the module goes through [`BufferView::transfer`];
//! - dropping the last clone of a wrapper runs its release action exactly once.

mod buffer;
mod element;
mod error;
mod ledger;
mod registry;

pub use buffer::{BufferDescriptor, BufferView, Ownership, SharedBuffer};
pub use element::ElementType;
pub use error::{BufferError, Result};
pub use ledger::{AllocationLedger, ExclusiveState};
pub use registry::{BufferRegistry, BufferReleaser, DirectReleaser};
