//! # vmux-tensor: Buffer Trees and Cross-Device Paging
//!
//! Models the unit of paging in the vmux runtime: a root tensor buffer
//! together with the sub-buffers aliasing into it and every tensor
//! entry backed by either. Paging relocates the whole tree to another
//! device while preserving reference aliasing, so that two entries
//! sharing a tensor cell before the move still share one afterwards.
//!
//! # Key Components
//!
//! - **Tensor headers**: dtype/shape metadata over a ref-counted
//!   device buffer
//! - **Cell arena**: shared mutable tensor cells indexed by small ids,
//!   so aliased entries carry an index instead of a raw pointer
//! - **Buffer tree**: root entries plus per-sub-buffer entry lists
//! - **Paging**: the relocation protocol, driven through a
//!   [`PageTarget`] implemented by the destination device

pub mod buffer;
pub mod cells;
pub mod paging;
pub mod tensor;
pub mod tree;

pub use buffer::{BufferId, DeviceBuffer};
pub use cells::{CellArena, CellId};
pub use paging::{page_tree, PageTarget};
pub use tensor::{Tensor, TensorDtype, TensorMeta};
pub use tree::{Entry, TensorBufferTree};

use thiserror::Error;

/// Tensor and paging errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Destination allocation failed while paging
    #[error("resource exhausted: destination allocation failed")]
    ResourceExhausted,

    /// Tree state violated an internal invariant
    #[error("internal: {0}")]
    Internal(String),

    /// The cross-device copy primitive reported a failure
    #[error("copy failed: {0}")]
    Copy(String),
}

/// Result type for tensor operations
pub type Result<T> = std::result::Result<T, Error>;
