//! Tasks: the unit of work a session submits

use std::fmt;
use vmux_device::PerTaskDevice;
use vmux_resource::{DeviceSpec, Resources};

/// Outcome status of a task run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task ran to completion
    Ok,
    /// Task failed; the message is surfaced in logs
    Failed(String),
    /// Task was rejected during shutdown before running
    Cancelled,
}

/// What a finished task reports back to the engine
#[derive(Debug, Clone)]
pub struct Completion {
    /// Outcome status
    pub status: TaskStatus,
    /// Resource usage the task observed while running, for accounting
    /// refinement
    pub observed_usage: Resources,
}

impl Completion {
    /// Successful completion with no usage report
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: TaskStatus::Ok,
            observed_usage: Resources::new(),
        }
    }

    /// Failed completion
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed(message.into()),
            observed_usage: Resources::new(),
        }
    }

    /// Attach observed usage
    #[must_use]
    pub fn with_observed_usage(mut self, usage: Resources) -> Self {
        self.observed_usage = usage;
        self
    }
}

/// A schedulable unit of work
///
/// The engine stages the declared resource request, binds a per-task
/// device and calls [`run`](Task::run) on a worker thread. The
/// resource context is reachable through the device.
pub trait Task: Send {
    /// Resource vector to stage at admission
    fn requested_resources(&self) -> Resources;

    /// Device this task wants, `None` for any
    fn preferred_device(&self) -> Option<DeviceSpec> {
        None
    }

    /// Execute on a worker thread
    fn run(&mut self, device: &PerTaskDevice) -> Completion;
}

/// Task built from a closure, mainly for tests and small kernels
pub struct ClosureTask {
    request: Resources,
    preferred: Option<DeviceSpec>,
    body: Box<dyn FnMut(&PerTaskDevice) -> Completion + Send>,
}

impl ClosureTask {
    /// Create a task with a resource request and a body
    #[must_use]
    pub fn new(
        request: Resources,
        body: impl FnMut(&PerTaskDevice) -> Completion + Send + 'static,
    ) -> Self {
        Self {
            request,
            preferred: None,
            body: Box::new(body),
        }
    }

    /// Builder: pin the task to a device
    #[must_use]
    pub fn with_device(mut self, spec: DeviceSpec) -> Self {
        self.preferred = Some(spec);
        self
    }
}

impl Task for ClosureTask {
    fn requested_resources(&self) -> Resources {
        self.request.clone()
    }

    fn preferred_device(&self) -> Option<DeviceSpec> {
        self.preferred
    }

    fn run(&mut self, device: &PerTaskDevice) -> Completion {
        (self.body)(device)
    }
}

impl fmt::Debug for ClosureTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureTask")
            .field("request", &self.request)
            .field("preferred", &self.preferred)
            .finish()
    }
}

/// A task queued inside a session, with admission bookkeeping
pub(crate) struct TaskItem {
    /// Submission sequence within the engine
    pub seq: u64,
    /// Declared request, cached at submit time
    pub request: Resources,
    /// Resolved target device
    pub target: DeviceSpec,
    /// The task itself
    pub task: Box<dyn Task>,
}

impl fmt::Debug for TaskItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskItem")
            .field("seq", &self.seq)
            .field("request", &self.request)
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmux_resource::{ResourceTag, ResourceType};

    #[test]
    fn test_completion_helpers() {
        assert_eq!(Completion::ok().status, TaskStatus::Ok);
        let failed = Completion::failed("kernel fault");
        assert!(matches!(failed.status, TaskStatus::Failed(_)));
    }

    #[test]
    fn test_closure_task_request_and_device() {
        let tag = ResourceTag::new(ResourceType::Memory, DeviceSpec::gpu(0));
        let task = ClosureTask::new(Resources::single(tag, 10), |_| Completion::ok())
            .with_device(DeviceSpec::gpu(0));

        assert_eq!(task.requested_resources().get(tag), 10);
        assert_eq!(task.preferred_device(), Some(DeviceSpec::gpu(0)));
    }

    #[test]
    fn test_observed_usage_attaches() {
        let tag = ResourceTag::new(ResourceType::Memory, DeviceSpec::gpu(0));
        let done = Completion::ok().with_observed_usage(Resources::single(tag, 5));
        assert_eq!(done.observed_usage.get(tag), 5);
    }
}
