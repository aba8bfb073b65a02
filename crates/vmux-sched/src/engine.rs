//! Execution engine: admission, dispatch and the scheduler loop
//!
//! One dedicated scheduler thread runs the outer loop: snapshot the
//! session list, consume the pending change set, ask the policy for
//! candidates, and let the policy advance each candidate. Admission
//! stages a ticket per task; admitted tasks get a per-task device and
//! run on the worker pool. When nothing was scheduled and nothing
//! changed, the loop blocks on a condition signal with a bounded
//! timeout. Wake sources: task submission, task completion, parameter
//! changes and shutdown.
//!
//! Admission failures never fail a task. The task stays at its queue
//! head, the typed refusal is logged at debug level, and the loop
//! moves on.

use crate::config::SchedulingParam;
use crate::policy::make_policy;
use crate::session::{SessionChangeSet, SessionItem};
use crate::task::{Completion, Task, TaskItem, TaskStatus};
use crate::workers::WorkerPool;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use vmux_device::{GraphHandle, PerTaskDevice, SharedDevice};
use vmux_resource::{
    AllocStats, AllocationSink, DeviceSpec, ResourceContext, ResourceMonitor, ResourceTag,
    ResourceType,
};

/// How `stop_scheduler` treats work that has not started yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Let queued worker jobs finish; queued session tasks stay queued
    #[default]
    Graceful,
    /// Drop queued session tasks and queued worker jobs
    Reject,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    admission_failures: AtomicU64,
    hol_bypassed: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of engine activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Tasks handed to the worker pool
    pub dispatched: u64,
    /// Tasks that finished running
    pub completed: u64,
    /// Admission attempts refused by the monitor
    pub admission_failures: u64,
    /// Tasks dispatched past a blocked queue head
    pub hol_bypassed: u64,
    /// Tasks dropped by a rejecting shutdown or session removal
    pub rejected: u64,
    /// Tasks currently running or queued on workers
    pub inflight: usize,
}

/// Outcome of one head-of-queue scheduling attempt
pub(crate) enum DispatchOutcome {
    /// The session queue was empty
    Empty,
    /// The head task was admitted and handed to a worker
    Dispatched,
    /// Admission failed on the given tag; the head stays queued
    AdmissionFailed(ResourceTag),
}

/// Shared engine state: everything both the public API and the
/// scheduler thread touch
pub(crate) struct EngineCore {
    /// Self-handle so dispatch closures can hold the core alive
    me: Weak<EngineCore>,
    monitor: Arc<ResourceMonitor>,
    devices: RwLock<HashMap<DeviceSpec, Arc<SharedDevice>>>,
    default_device: RwLock<Option<DeviceSpec>>,
    sessions: Mutex<Vec<Arc<SessionItem>>>,
    changes: Mutex<SessionChangeSet>,
    params: RwLock<SchedulingParam>,
    stats: Arc<AllocStats>,
    wake_flag: Mutex<bool>,
    wake_cond: Condvar,
    stop: AtomicBool,
    inflight: AtomicUsize,
    pool: WorkerPool,
    counters: Counters,
    next_session_seq: AtomicU64,
    next_graph_id: AtomicU64,
    next_task_seq: AtomicU64,
}

impl EngineCore {
    pub(crate) fn new(
        monitor: Arc<ResourceMonitor>,
        params: SchedulingParam,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            monitor,
            devices: RwLock::new(HashMap::new()),
            default_device: RwLock::new(None),
            sessions: Mutex::new(Vec::new()),
            changes: Mutex::new(SessionChangeSet::default()),
            params: RwLock::new(params),
            stats: Arc::new(AllocStats::new()),
            wake_flag: Mutex::new(false),
            wake_cond: Condvar::new(),
            stop: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            pool: WorkerPool::new(workers.max(1)),
            counters: Counters::default(),
            next_session_seq: AtomicU64::new(0),
            next_graph_id: AtomicU64::new(1),
            next_task_seq: AtomicU64::new(1),
        })
    }

    pub(crate) fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub(crate) fn params(&self) -> SchedulingParam {
        self.params.read().clone()
    }

    fn snapshot_sessions(&self) -> Vec<Arc<SessionItem>> {
        self.sessions.lock().clone()
    }

    fn take_changes(&self) -> SessionChangeSet {
        std::mem::take(&mut *self.changes.lock())
    }

    pub(crate) fn wake(&self) {
        let mut flag = self.wake_flag.lock();
        *flag = true;
        self.wake_cond.notify_all();
    }

    fn wait_for_wake(&self, timeout: Duration) {
        let mut flag = self.wake_flag.lock();
        if !*flag {
            let _ = self.wake_cond.wait_for(&mut flag, timeout);
        }
        *flag = false;
    }

    /// Stage a ticket for a task and bind a resource context
    fn admit(
        &self,
        session: &Arc<SessionItem>,
        item: &TaskItem,
    ) -> std::result::Result<ResourceContext, ResourceTag> {
        match self.monitor.mint_staging(&item.request) {
            Ok(ticket) => {
                let mut rctx = ResourceContext::new(
                    Arc::clone(&self.monitor),
                    session.graph_id(),
                    item.target,
                    ticket,
                );
                rctx.add_listener(AllocationSink::Stats(Arc::clone(&self.stats)));
                session.track_ticket(ticket);
                Ok(rctx)
            }
            Err(vmux_resource::Error::OutOfCapacity {
                tag,
                requested,
                available,
            }) => {
                self.counters.admission_failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session = session.handle(),
                    task = item.seq,
                    %tag,
                    requested,
                    available,
                    "task admission refused"
                );
                Err(tag)
            }
            Err(err) => {
                self.counters.admission_failures.fetch_add(1, Ordering::Relaxed);
                debug!(session = session.handle(), %err, "task admission refused");
                Err(item
                    .request
                    .tags()
                    .next()
                    .unwrap_or_else(|| ResourceTag::new(ResourceType::Memory, item.target)))
            }
        }
    }

    /// Try to admit and dispatch the task at the session's queue head
    pub(crate) fn try_dispatch_head(&self, session: &Arc<SessionItem>) -> DispatchOutcome {
        let item = {
            let mut queue = session.queue_lock();
            match queue.pop_front() {
                Some(item) => item,
                None => return DispatchOutcome::Empty,
            }
        };

        match self.admit(session, &item) {
            Ok(rctx) => {
                self.dispatch(session, item, rctx);
                session.reset_hol();
                DispatchOutcome::Dispatched
            }
            Err(tag) => {
                // The head goes back where it was.
                session.queue_lock().push_front(item);
                DispatchOutcome::AdmissionFailed(tag)
            }
        }
    }

    /// Dispatch admissible tasks behind a blocked head
    ///
    /// Only tasks that do not touch the blocked tag are considered.
    /// Every bypassed task bumps the session's waiting counter, capped
    /// at `max_hol_waiting`; the counter resets when the head finally
    /// dispatches.
    pub(crate) fn try_bypass(&self, session: &Arc<SessionItem>, blocked: ResourceTag) -> usize {
        let params = self.params();
        if !params.work_conservative {
            return 0;
        }

        let mut dispatched = 0;
        let mut scan_from = 1;
        while session.hol_waiting() < params.max_hol_waiting {
            // The scheduler thread is the only remover, so indices
            // found here stay valid until we act on them.
            let candidate = {
                let queue = session.queue_lock();
                queue
                    .iter()
                    .enumerate()
                    .skip(scan_from)
                    .find(|(_, item)| item.request.get(blocked) == 0)
                    .map(|(idx, _)| idx)
            };
            let Some(idx) = candidate else { break };

            let item = match session.queue_lock().remove(idx) {
                Some(item) => item,
                None => break,
            };
            match self.admit(session, &item) {
                Ok(rctx) => {
                    self.dispatch(session, item, rctx);
                    session.bump_hol();
                    self.counters.hol_bypassed.fetch_add(1, Ordering::Relaxed);
                    dispatched += 1;
                    scan_from = idx;
                }
                Err(_) => {
                    session.queue_lock().insert(idx, item);
                    scan_from = idx + 1;
                }
            }
        }
        dispatched
    }

    fn dispatch(&self, session: &Arc<SessionItem>, item: TaskItem, rctx: ResourceContext) {
        let device = self
            .devices
            .read()
            .get(&item.target)
            .cloned()
            .expect("dispatch target validated at submit");
        let ptd = device.create_per_task(session.graph(), rctx);

        session.mark_scheduled();
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        trace!(session = session.handle(), task = item.seq, "task dispatched");

        let core = self.me.upgrade().expect("engine core alive while dispatching");
        let session = Arc::clone(session);
        let seq = item.seq;
        let mut task = item.task;
        self.pool.execute(Box::new(move || {
            let completion = task.run(&ptd);
            core.finish_task(&session, seq, ptd, completion);
        }));
    }

    fn finish_task(
        &self,
        session: &Arc<SessionItem>,
        seq: u64,
        mut ptd: PerTaskDevice,
        completion: Completion,
    ) {
        // Return this task's stream units, pool slots first; memory
        // commitments stay attributed to the ticket until dealloc or
        // session teardown.
        let held = ptd.release_streams() as u64;
        if held > 0 {
            let rctx = ptd.resource_context();
            let tag = ResourceTag::new(ResourceType::GpuStream, rctx.spec());
            let committed = self
                .monitor
                .committed(rctx.ticket())
                .map(|res| res.get(tag))
                .unwrap_or(0);
            let freeable = held.min(committed);
            if freeable > 0 {
                rctx.dealloc(ResourceType::GpuStream, freeable);
            }
        }

        match &completion.status {
            TaskStatus::Ok => trace!(session = session.handle(), task = seq, "task completed"),
            TaskStatus::Failed(msg) => {
                warn!(session = session.handle(), task = seq, error = msg.as_str(), "task failed");
            }
            TaskStatus::Cancelled => {
                debug!(session = session.handle(), task = seq, "task cancelled");
            }
        }

        drop(ptd);
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.wake();
    }
}

static_assertions::assert_impl_all!(EngineCore: Send, Sync);

fn scheduler_loop(core: Arc<EngineCore>) {
    debug!("scheduler thread started");
    let mut kind = core.params().policy;
    let mut policy = make_policy(kind, Arc::clone(&core));

    loop {
        if core.stop.load(Ordering::Acquire) {
            break;
        }

        // Parameter swaps take effect here, at iteration boundaries.
        let current = core.params().policy;
        if current != kind {
            debug!(from = kind.name(), to = current.name(), "scheduling policy swapped");
            kind = current;
            policy = make_policy(kind, Arc::clone(&core));
        }

        let sessions = core.snapshot_sessions();
        let changes = core.take_changes();
        let candidates = policy.select_candidates(&sessions, &changes);

        let mut total = 0;
        for session in &candidates {
            if core.stop.load(Ordering::Acquire) {
                break;
            }
            loop {
                let (scheduled, keep_going) = policy.maybe_schedule_from(session);
                total += scheduled;
                if !keep_going || core.stop.load(Ordering::Acquire) {
                    break;
                }
            }
        }

        if total == 0 && changes.is_empty() {
            core.wait_for_wake(Duration::from_millis(10));
        } else {
            std::thread::yield_now();
        }
    }
    debug!("scheduler thread stopped");
}

/// The engine: public entry point of the runtime core
///
/// Owns the monitor, the registered devices, every session, the worker
/// pool and the scheduler thread. Tests instantiate isolated engines;
/// nothing here is process-global.
pub struct ExecutionEngine {
    core: Arc<EngineCore>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ExecutionEngine {
    /// Engine with default parameters and a small worker pool
    #[must_use]
    pub fn new(monitor: Arc<ResourceMonitor>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        Self::with_config(monitor, SchedulingParam::default(), workers)
    }

    /// Engine with explicit parameters and worker count
    #[must_use]
    pub fn with_config(
        monitor: Arc<ResourceMonitor>,
        params: SchedulingParam,
        workers: usize,
    ) -> Self {
        Self {
            core: EngineCore::new(monitor, params, workers),
            thread: Mutex::new(None),
        }
    }

    /// Register a shared device; the first one becomes the default
    /// target for tasks without a device preference
    pub fn register_device(&self, device: Arc<SharedDevice>) {
        let spec = device.spec();
        // Existing sessions want stream maps on the new device too.
        for session in self.core.snapshot_sessions() {
            if let Err(err) = device.fill_context_map(session.graph()) {
                warn!(%spec, %err, "stream assignment failed for existing session");
            }
        }
        self.core.devices.write().insert(spec, device);
        let mut default = self.core.default_device.write();
        if default.is_none() {
            *default = Some(spec);
        }
    }

    /// Create a session for a graph
    ///
    /// Fills the stream-assignment cache of every registered device
    /// for the session's graph.
    pub fn create_session(&self, handle: &str, graph: GraphHandle) -> Result<Arc<SessionItem>> {
        {
            let sessions = self.core.sessions.lock();
            if sessions.iter().any(|s| s.handle() == handle) {
                return Err(Error::DuplicateSession(handle.to_string()));
            }
        }
        for device in self.core.devices.read().values() {
            device.fill_context_map(&graph)?;
        }

        let seq = self.core.next_session_seq.fetch_add(1, Ordering::Relaxed);
        let graph_id = self.core.next_graph_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(SessionItem::new(handle.to_string(), graph, graph_id, seq));

        self.core.sessions.lock().push(Arc::clone(&session));
        self.core.changes.lock().added.push(handle.to_string());
        self.core.wake();
        debug!(session = handle, graph_id, "session created");
        Ok(session)
    }

    /// Tear a session down, freeing everything its tickets still hold
    pub fn remove_session(&self, handle: &str) -> Result<()> {
        let session = {
            let mut sessions = self.core.sessions.lock();
            let idx = sessions
                .iter()
                .position(|s| s.handle() == handle)
                .ok_or_else(|| Error::UnknownSession(handle.to_string()))?;
            sessions.swap_remove(idx)
        };

        let dropped = session.clear_queue().len() as u64;
        self.core.counters.rejected.fetch_add(dropped, Ordering::Relaxed);
        for ticket in session.take_tickets() {
            self.core.monitor.release_ticket(ticket);
        }

        self.core.changes.lock().removed.push(handle.to_string());
        self.core.wake();
        debug!(session = handle, dropped, "session removed");
        Ok(())
    }

    /// Append a task to a session's queue and wake the scheduler
    pub fn submit(&self, handle: &str, task: Box<dyn Task>) -> Result<u64> {
        let session = {
            let sessions = self.core.sessions.lock();
            sessions
                .iter()
                .find(|s| s.handle() == handle)
                .cloned()
                .ok_or_else(|| Error::UnknownSession(handle.to_string()))?
        };

        let target = match task.preferred_device() {
            Some(spec) => spec,
            None => {
                let default = *self.core.default_device.read();
                default.ok_or(Error::NoDevices)?
            }
        };
        if !self.core.devices.read().contains_key(&target) {
            return Err(Error::UnknownDevice(target));
        }

        let seq = self.core.next_task_seq.fetch_add(1, Ordering::Relaxed);
        let request = task.requested_resources();
        session.enqueue(TaskItem {
            seq,
            request,
            target,
            task,
        });
        self.core.wake();
        Ok(seq)
    }

    /// Swap scheduling parameters; effective next iteration
    pub fn set_scheduling_param(&self, params: SchedulingParam) {
        *self.core.params.write() = params;
        self.core.wake();
    }

    /// Current scheduling parameters
    #[must_use]
    pub fn scheduling_param(&self) -> SchedulingParam {
        self.core.params()
    }

    /// Launch the scheduler thread
    pub fn start_scheduler(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.core.stop.store(false, Ordering::Release);
        let core = Arc::clone(&self.core);
        *thread = Some(
            std::thread::Builder::new()
                .name("vmux-sched".to_string())
                .spawn(move || scheduler_loop(core))
                .expect("spawning scheduler thread"),
        );
        Ok(())
    }

    /// Cooperative shutdown with the default graceful mode
    pub fn stop_scheduler(&self) {
        self.stop_scheduler_with(ShutdownMode::Graceful);
    }

    /// Cooperative shutdown: stop the loop, settle work, join
    pub fn stop_scheduler_with(&self, mode: ShutdownMode) {
        self.core.stop.store(true, Ordering::Release);
        self.core.wake();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }

        if mode == ShutdownMode::Reject {
            for session in self.core.snapshot_sessions() {
                let dropped = session.clear_queue().len() as u64;
                self.core.counters.rejected.fetch_add(dropped, Ordering::Relaxed);
            }
        }
        self.core.pool.shutdown(mode == ShutdownMode::Reject);
    }

    /// Activity counters snapshot
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let c = &self.core.counters;
        EngineStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            admission_failures: c.admission_failures.load(Ordering::Relaxed),
            hol_bypassed: c.hol_bypassed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            inflight: self.core.inflight.load(Ordering::SeqCst),
        }
    }

    /// Shared resource monitor
    #[must_use]
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.core.monitor
    }

    /// Per-graph allocation statistics fed by every admitted context
    #[must_use]
    pub fn alloc_stats(&self) -> &Arc<AllocStats> {
        &self.core.stats
    }

    /// Block until every queue is empty and nothing is in flight
    ///
    /// Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let queued: usize = self
                .core
                .snapshot_sessions()
                .iter()
                .map(|s| s.queue_len())
                .sum();
            if queued == 0
                && self.core.inflight.load(Ordering::SeqCst) == 0
                && self.core.pool.queued() == 0
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        self.stop_scheduler();
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("params", &self.core.params())
            .field("sessions", &self.core.sessions.lock().len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use vmux_resource::Resources;

    /// Minimal core plus detached sessions for policy unit tests
    pub(crate) fn core_with_sessions(count: usize) -> (Arc<EngineCore>, Vec<Arc<SessionItem>>) {
        let monitor = Arc::new(ResourceMonitor::new(Resources::new()));
        let core = EngineCore::new(monitor, SchedulingParam::default(), 1);
        let sessions = (0..count)
            .map(|i| {
                Arc::new(SessionItem::new(
                    format!("sess-{i}"),
                    GraphHandle::new(Vec::new()),
                    i as u64,
                    i as u64,
                ))
            })
            .collect();
        (core, sessions)
    }
}
