//! Session items: per-session queues and scheduling bookkeeping

use crate::task::TaskItem;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use vmux_device::GraphHandle;
use vmux_resource::{ResourceMonitor, Ticket};

/// One client session: a task queue plus scheduling state
///
/// Sessions are totally ordered by insertion sequence; policies use
/// that order for tie-breaks and for the preempt policy's notion of
/// session age.
pub struct SessionItem {
    handle: String,
    graph: GraphHandle,
    graph_id: u64,
    insertion_seq: u64,
    queue: Mutex<VecDeque<TaskItem>>,
    /// Protected sessions are skipped by paging victims selection
    protected: AtomicBool,
    /// Whether this session's buffers may migrate between devices
    pagable: AtomicBool,
    /// Tasks skipped past the blocked queue head so far
    hol_waiting: AtomicU64,
    last_scheduled: Mutex<Option<Instant>>,
    /// Tickets admitted on behalf of this session, for teardown
    tickets: Mutex<Vec<Ticket>>,
}

impl SessionItem {
    pub(crate) fn new(handle: String, graph: GraphHandle, graph_id: u64, insertion_seq: u64) -> Self {
        Self {
            handle,
            graph,
            graph_id,
            insertion_seq,
            queue: Mutex::new(VecDeque::new()),
            protected: AtomicBool::new(false),
            pagable: AtomicBool::new(true),
            hol_waiting: AtomicU64::new(0),
            last_scheduled: Mutex::new(None),
            tickets: Mutex::new(Vec::new()),
        }
    }

    /// Session handle
    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Graph this session executes
    #[must_use]
    pub fn graph(&self) -> &GraphHandle {
        &self.graph
    }

    /// Graph identity used in allocation events
    #[inline]
    #[must_use]
    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    /// Insertion order, for tie-breaks
    #[inline]
    #[must_use]
    pub fn insertion_seq(&self) -> u64 {
        self.insertion_seq
    }

    /// Number of queued tasks
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when no tasks are queued
    #[must_use]
    pub fn queue_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Tasks skipped past the current blocked head
    #[must_use]
    pub fn hol_waiting(&self) -> u64 {
        self.hol_waiting.load(Ordering::Relaxed)
    }

    /// Mark this session's buffers as migratable or pinned
    pub fn set_pagable(&self, pagable: bool) {
        self.pagable.store(pagable, Ordering::Relaxed);
    }

    /// Whether this session's buffers may migrate
    #[must_use]
    pub fn is_pagable(&self) -> bool {
        self.pagable.load(Ordering::Relaxed)
    }

    /// Shield this session from paging victim selection
    pub fn set_protected(&self, protected: bool) {
        self.protected.store(protected, Ordering::Relaxed);
    }

    /// Whether this session is shielded from paging
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::Relaxed)
    }

    /// When the session last dispatched a task
    #[must_use]
    pub fn last_scheduled(&self) -> Option<Instant> {
        *self.last_scheduled.lock()
    }

    /// Committed resources attributed to this session, summed over tags
    #[must_use]
    pub fn footprint(&self, monitor: &ResourceMonitor) -> u64 {
        self.tickets
            .lock()
            .iter()
            .filter_map(|ticket| monitor.committed(*ticket))
            .map(|res| res.iter().map(|(_, amount)| amount).sum::<u64>())
            .sum()
    }

    pub(crate) fn queue_lock(&self) -> MutexGuard<'_, VecDeque<TaskItem>> {
        self.queue.lock()
    }

    pub(crate) fn enqueue(&self, item: TaskItem) {
        self.queue.lock().push_back(item);
    }

    pub(crate) fn bump_hol(&self) {
        self.hol_waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_hol(&self) {
        self.hol_waiting.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark_scheduled(&self) {
        *self.last_scheduled.lock() = Some(Instant::now());
    }

    pub(crate) fn track_ticket(&self, ticket: Ticket) {
        self.tickets.lock().push(ticket);
    }

    pub(crate) fn take_tickets(&self) -> Vec<Ticket> {
        std::mem::take(&mut *self.tickets.lock())
    }

    pub(crate) fn clear_queue(&self) -> Vec<TaskItem> {
        self.queue.lock().drain(..).collect()
    }
}

impl std::fmt::Debug for SessionItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionItem")
            .field("handle", &self.handle)
            .field("graph_id", &self.graph_id)
            .field("queued", &self.queue_len())
            .field("hol_waiting", &self.hol_waiting())
            .finish()
    }
}

/// Sessions added and removed since the last scheduling iteration
#[derive(Debug, Default)]
pub struct SessionChangeSet {
    /// Handles of sessions created since the last iteration
    pub added: Vec<String>,
    /// Handles of sessions removed since the last iteration
    pub removed: Vec<String>,
}

impl SessionChangeSet {
    /// True when nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
