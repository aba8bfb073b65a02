//! # vmux-resource: Typed Resource Accounting for vmux
//!
//! This crate is the admission-control core of the vmux GPU-sharing
//! runtime. Every task that wants to touch a device first reserves a
//! typed resource vector here, and every byte of device memory and every
//! GPU stream a task ends up holding is attributable to a ticket minted
//! by this crate.
//!
//! # Key Components
//!
//! - **Resource Monitor**: per-device capacities with two-phase
//!   (staging then commit) accounting, keyed by ticket
//! - **Resource Context**: a per-ticket handle with scoped
//!   commit/rollback operations
//! - **Allocation Sinks**: fan-out of allocation events to logging and
//!   per-graph statistics
//!
//! # Two-phase admission
//!
//! ```text
//! mint_staging(req) ──▶ staging[ticket] ──▶ allocate(ticket, res)
//!                            │                      │
//!                            │ free_staging         │ free
//!                            ▼                      ▼
//!                        (released)           in_use shrinks,
//!                                             last free erases ticket
//! ```
//!
//! Staging reservations count against capacity exactly like committed
//! allocations, so a successful `mint_staging` guarantees the later
//! commit cannot oversubscribe the device.

pub mod context;
pub mod listener;
pub mod monitor;
pub mod types;

pub use context::{OperationScope, ResourceContext};
pub use listener::{AllocStats, AllocationSink, GraphUsage};
pub use monitor::{MonitorProxy, ResourceMonitor};
pub use types::{DeviceKind, DeviceSpec, ResourceTag, ResourceType, Resources, Ticket};

use thiserror::Error;

/// Resource accounting errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Admission failed: the named tag cannot fit within capacity
    #[error("out of capacity for {tag}: requested {requested}, available {available}")]
    OutOfCapacity {
        /// Tag that failed the capacity test
        tag: ResourceTag,
        /// Amount requested for the tag
        requested: u64,
        /// Amount still available for the tag
        available: u64,
    },

    /// Operation referenced a ticket unknown to the monitor
    #[error("unknown ticket {0}")]
    UnknownTicket(Ticket),

    /// Internal invariant violation surfaced as an error
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for resource operations
pub type Result<T> = std::result::Result<T, Error>;
