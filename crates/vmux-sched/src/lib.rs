//! # vmux-sched: Session Scheduling and Execution
//!
//! The engine at the center of the vmux runtime. Client sessions
//! submit tasks; a dedicated scheduler thread selects among runnable
//! sessions under a pluggable policy, admits tasks against the
//! resource monitor, binds per-task devices, and hands admitted tasks
//! to a worker pool. Completions wake the scheduler again.
//!
//! # Key Components
//!
//! - **Session items**: per-session FIFO task queues with head-of-line
//!   bookkeeping
//! - **Policies**: fair, preempt, pack, rr and fifo candidate
//!   selection and per-session scheduling
//! - **Execution engine**: the outer loop, admission, head-of-line
//!   bypass, worker dispatch and shutdown
//!
//! # Scheduling model
//!
//! One scheduler thread owns the outer loop; worker threads run tasks
//! and report completions through a condition signal. Admission
//! failures never fail a task: the task stays at its queue head and
//! the loop moves on.

pub mod config;
pub mod engine;
pub mod policy;
pub mod session;
pub mod task;
mod workers;

pub use config::{PolicyKind, SchedulingParam};
pub use engine::{EngineStats, ExecutionEngine, ShutdownMode};
pub use policy::SchedulingPolicy;
pub use session::{SessionChangeSet, SessionItem};
pub use task::{ClosureTask, Completion, Task, TaskStatus};

use thiserror::Error;
use vmux_resource::DeviceSpec;

/// Scheduling and engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Operation referenced a session the engine does not know
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A session with this handle already exists
    #[error("session already exists: {0}")]
    DuplicateSession(String),

    /// Task targeted a device the engine has no wrapper for
    #[error("no device registered for {0}")]
    UnknownDevice(DeviceSpec),

    /// No devices are registered at all
    #[error("no devices registered")]
    NoDevices,

    /// The scheduler thread is already running
    #[error("scheduler already running")]
    AlreadyRunning,

    /// Resource accounting error
    #[error(transparent)]
    Resource(#[from] vmux_resource::Error),

    /// Device layer error
    #[error(transparent)]
    Device(#[from] vmux_device::Error),
}

/// Result type for scheduling operations
pub type Result<T> = std::result::Result<T, Error>;
