//! # vmux-device: Shared and Per-Task Devices
//!
//! A shared device wraps one physical device for the whole runtime: it
//! owns the pool of physical GPU streams, the per-graph stream
//! assignment cache, and the backend adapter that performs actual
//! allocation, DMA and stream coloring. Each admitted task gets a
//! [`PerTaskDevice`]: a thin wrapper scoped to that task's ticket,
//! carrying the task's physical stream assignments and serving as the
//! destination of paging operations.
//!
//! # Key Components
//!
//! - **Backend adapter**: the narrow seam to the numerical library
//!   (allocator selection, callback DMA, deterministic stream
//!   assignment), with an in-process host backend for tests
//! - **Stream pool**: first-fit allocation of physical stream slots
//! - **Shared device**: stream-assignment cache keyed by graph
//!   fingerprint
//! - **Per-task device**: stream binding protocol and node-to-context
//!   lookup

pub mod adapter;
pub mod graph;
pub mod per_task;
pub mod shared;
pub mod streams;

pub use adapter::{AllocatorAttrs, DeviceBackend, DmaDone, HostBackend, Notification, TensorAllocator};
pub use graph::{GraphFingerprint, GraphHandle, NodeDef, NodeId, NodeStreamMap};
pub use per_task::PerTaskDevice;
pub use shared::{DeviceContext, SharedDevice};
pub use streams::StreamPool;

use thiserror::Error;

/// Device layer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The backend could not produce a stream assignment for a graph
    #[error("stream assignment failed: {0}")]
    StreamAssignment(String),

    /// The pool had fewer free streams than the reservation granted
    #[error("stream shortage: requested {requested}, got {got}")]
    StreamShortage {
        /// Streams the reservation granted
        requested: usize,
        /// Streams the pool could hand out
        got: usize,
    },

    /// Internal invariant violation surfaced as an error
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, Error>;
