//! Resource contexts: per-ticket handles with scoped commit/rollback
//!
//! A [`ResourceContext`] binds one ticket to one primary device. Tasks
//! commit their staged reservations through it, paging re-points a
//! clone of it at the destination device, and dropping the last handle
//! releases whatever staging is still pledged.

use crate::listener::AllocationSink;
use crate::monitor::{MonitorProxy, ResourceMonitor};
use crate::types::{DeviceSpec, ResourceTag, ResourceType, Resources, Ticket};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Handle binding a ticket to a session graph and a primary device
///
/// The context borrows the monitor through an `Arc`; the engine owns
/// the monitor, so the monitor always outlives every context.
pub struct ResourceContext {
    monitor: Arc<ResourceMonitor>,
    graph_id: u64,
    spec: DeviceSpec,
    ticket: Ticket,
    // Single-winner flag: exactly one release among all clones sharing
    // the ticket reaches the monitor.
    has_staging: AtomicBool,
    listeners: Vec<AllocationSink>,
}

impl ResourceContext {
    /// Create a context for a freshly staged ticket
    ///
    /// # Panics
    ///
    /// Panics when handed the invalid ticket.
    #[must_use]
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        graph_id: u64,
        spec: DeviceSpec,
        ticket: Ticket,
    ) -> Self {
        assert!(ticket.is_valid(), "resource context needs a valid ticket");
        Self {
            monitor,
            graph_id,
            spec,
            ticket,
            has_staging: AtomicBool::new(true),
            listeners: Vec::new(),
        }
    }

    /// Clone this context re-pointed at another device
    ///
    /// The clone shares the ticket and listeners but never owns the
    /// staging release; that stays with the original.
    #[must_use]
    pub fn clone_for(&self, spec: DeviceSpec) -> Self {
        Self {
            monitor: Arc::clone(&self.monitor),
            graph_id: self.graph_id,
            spec,
            ticket: self.ticket,
            has_staging: AtomicBool::new(false),
            listeners: self.listeners.clone(),
        }
    }

    /// Attach an allocation sink
    pub fn add_listener(&mut self, sink: AllocationSink) {
        self.listeners.push(sink);
    }

    /// Ticket owned by this context
    #[inline]
    #[must_use]
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Primary device of this context
    #[inline]
    #[must_use]
    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    /// Graph identity this context accounts for
    #[inline]
    #[must_use]
    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    /// Shared monitor handle
    #[must_use]
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Commit the full staged amount for `ty` on this device
    ///
    /// Returns an invalid scope when nothing is staged for the tag or
    /// the commit could not be satisfied.
    pub fn alloc(&self, ty: ResourceType) -> OperationScope<'_> {
        let tag = ResourceTag::new(ty, self.spec);
        let proxy = self.monitor.lock();

        let staged = proxy.query_staging(self.ticket, tag);
        let mut scope = OperationScope::new(self, proxy);
        let Some(amount) = staged else {
            return scope;
        };

        scope.res.set(tag, amount);
        scope.valid = scope
            .proxy
            .as_mut()
            .expect("proxy held until scope exit")
            .allocate(self.ticket, &scope.res);
        scope
    }

    /// Commit exactly `amount` units of `ty`, without consulting staging
    pub fn alloc_n(&self, ty: ResourceType, amount: u64) -> OperationScope<'_> {
        let tag = ResourceTag::new(ty, self.spec);
        let proxy = self.monitor.lock();

        let mut scope = OperationScope::new(self, proxy);
        scope.res.set(tag, amount);
        scope.valid = scope
            .proxy
            .as_mut()
            .expect("proxy held until scope exit")
            .allocate(self.ticket, &scope.res);
        scope
    }

    /// Free `amount` committed units of `ty` and notify listeners
    pub fn dealloc(&self, ty: ResourceType, amount: u64) {
        let tag = ResourceTag::new(ty, self.spec);
        let res = Resources::single(tag, amount);

        let last = self.monitor.free(self.ticket, &res);
        for listener in &self.listeners {
            listener.notify_dealloc(self.graph_id, self.ticket, tag, amount, last);
        }
    }

    /// Release any residual staging tied to this context's ticket
    ///
    /// Idempotent, and exclusive between clones sharing the ticket:
    /// only the winner of the flag swap reaches the monitor.
    pub fn release_staging(&self) {
        if self
            .has_staging
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.monitor.free_staging(self.ticket);
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        self.release_staging();
    }
}

impl fmt::Display for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ticket.is_valid() {
            return f.write_str("ticket#invalid");
        }
        write!(f, "{}@{} (graph {})", self.ticket, self.spec, self.graph_id)
    }
}

impl fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContext")
            .field("graph_id", &self.graph_id)
            .field("spec", &self.spec)
            .field("ticket", &self.ticket)
            .field("has_staging", &self.has_staging.load(Ordering::Relaxed))
            .finish()
    }
}

/// Scoped commit over the monitor
///
/// Holds the monitor proxy for its whole lifetime. The two exit paths
/// are explicit: [`commit`](Self::commit) publishes the allocation to
/// listeners, [`rollback`](Self::rollback) returns the resources to the
/// monitor. Dropping a valid scope without either commits, since the
/// session is assumed to have used the allocation.
pub struct OperationScope<'a> {
    ctx: &'a ResourceContext,
    proxy: Option<MonitorProxy<'a>>,
    res: Resources,
    valid: bool,
    explicit: bool,
}

impl<'a> OperationScope<'a> {
    fn new(ctx: &'a ResourceContext, proxy: MonitorProxy<'a>) -> Self {
        Self {
            ctx,
            proxy: Some(proxy),
            res: Resources::new(),
            valid: false,
            explicit: false,
        }
    }

    /// True when the commit succeeded and the scope carries resources
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Resources committed under this scope
    #[must_use]
    pub fn resources(&self) -> &Resources {
        &self.res
    }

    /// Return the committed resources to the monitor
    pub fn rollback(mut self) {
        debug_assert!(self.valid, "rollback on an invalid scope");
        if self.valid {
            if let Some(proxy) = self.proxy.as_mut() {
                proxy.free(self.ctx.ticket, &self.res);
            }
            self.valid = false;
        }
    }

    /// Keep the allocation and notify listeners
    pub fn commit(mut self) {
        self.explicit = true;
    }
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        // Release the monitor lock before any listener runs.
        let proxy = self.proxy.take();
        drop(proxy);

        if !self.valid {
            return;
        }
        if !self.explicit {
            debug!(ctx = %self.ctx, "scope dropped without explicit commit, committing");
        }
        for (tag, amount) in self.res.iter() {
            for listener in &self.ctx.listeners {
                listener.notify_alloc(self.ctx.graph_id, self.ctx.ticket, tag, amount);
            }
        }
    }
}

static_assertions::assert_impl_all!(ResourceContext: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{AllocStats, GraphUsage};
    use crate::types::{DeviceKind, DeviceSpec};

    fn mem_tag() -> ResourceTag {
        ResourceTag::new(ResourceType::Memory, DeviceSpec::gpu(0))
    }

    fn stream_tag() -> ResourceTag {
        ResourceTag::new(ResourceType::GpuStream, DeviceSpec::gpu(0))
    }

    fn monitor() -> Arc<ResourceMonitor> {
        let mut cap = Resources::single(mem_tag(), 100);
        cap.add(stream_tag(), 4);
        Arc::new(ResourceMonitor::new(cap))
    }

    fn staged_context(mon: &Arc<ResourceMonitor>, req: Resources) -> ResourceContext {
        let ticket = mon.mint_staging(&req).unwrap();
        ResourceContext::new(Arc::clone(mon), 1, DeviceSpec::gpu(0), ticket)
    }

    #[test]
    fn test_alloc_commits_full_staged_amount() {
        let mon = monitor();
        let ctx = staged_context(&mon, Resources::single(mem_tag(), 40));

        let scope = ctx.alloc(ResourceType::Memory);
        assert!(scope.is_valid());
        assert_eq!(scope.resources().get(mem_tag()), 40);
        drop(scope);

        assert_eq!(mon.in_use(mem_tag()), 40);
        assert_eq!(mon.staged(ctx.ticket()), None);
    }

    #[test]
    fn test_alloc_without_staging_is_invalid() {
        let mon = monitor();
        let ctx = staged_context(&mon, Resources::single(mem_tag(), 40));

        let scope = ctx.alloc(ResourceType::GpuStream);
        assert!(!scope.is_valid());
        drop(scope);
        assert_eq!(mon.in_use(stream_tag()), 0);
    }

    #[test]
    fn test_alloc_n_ignores_staging() {
        let mon = monitor();
        let ctx = staged_context(&mon, Resources::single(mem_tag(), 10));

        let scope = ctx.alloc_n(ResourceType::Memory, 25);
        assert!(scope.is_valid());
        drop(scope);

        // 10 from staging, 15 from free capacity.
        assert_eq!(mon.in_use(mem_tag()), 25);
    }

    #[test]
    fn test_rollback_returns_resources() {
        let mon = monitor();
        let ctx = staged_context(&mon, Resources::single(mem_tag(), 40));

        let scope = ctx.alloc(ResourceType::Memory);
        assert!(scope.is_valid());
        scope.rollback();

        assert_eq!(mon.in_use(mem_tag()), 0);
        // Rollback does not restore staging; it frees the commitment.
        assert_eq!(mon.staged(ctx.ticket()), None);
    }

    #[test]
    fn test_commit_notifies_listeners() {
        let mon = monitor();
        let stats = Arc::new(AllocStats::new());
        let mut ctx = staged_context(&mon, Resources::single(mem_tag(), 40));
        ctx.add_listener(AllocationSink::Stats(Arc::clone(&stats)));

        ctx.alloc(ResourceType::Memory).commit();
        assert_eq!(stats.usage(1, mem_tag()).current, 40);

        ctx.dealloc(ResourceType::Memory, 40);
        assert_eq!(stats.usage(1, mem_tag()).current, 0);
        assert_eq!(stats.usage(1, mem_tag()).peak, 40);
    }

    #[test]
    fn test_invalid_scope_does_not_notify() {
        let mon = monitor();
        let stats = Arc::new(AllocStats::new());
        let mut ctx = staged_context(&mon, Resources::single(mem_tag(), 40));
        ctx.add_listener(AllocationSink::Stats(Arc::clone(&stats)));

        ctx.alloc(ResourceType::GpuStream).commit();
        assert_eq!(stats.usage(1, stream_tag()), GraphUsage::default());
    }

    #[test]
    fn test_release_staging_idempotent() {
        let mon = monitor();
        let ctx = staged_context(&mon, Resources::single(mem_tag(), 40));
        let ticket = ctx.ticket();

        ctx.release_staging();
        assert!(!mon.ticket_exists(ticket));
        ctx.release_staging();
        assert_eq!(mon.staged_total(mem_tag()), 0);
    }

    #[test]
    fn test_clone_never_releases_staging() {
        let mon = monitor();
        let ctx = staged_context(&mon, Resources::single(mem_tag(), 40));
        let clone = ctx.clone_for(DeviceSpec::gpu(1));

        assert_eq!(clone.ticket(), ctx.ticket());
        assert_eq!(clone.spec().kind, DeviceKind::Gpu);
        drop(clone);

        // The original still holds the staging.
        assert_eq!(mon.staged_total(mem_tag()), 40);
        drop(ctx);
        assert_eq!(mon.staged_total(mem_tag()), 0);
    }

    #[test]
    fn test_drop_releases_staging() {
        let mon = monitor();
        {
            let _ctx = staged_context(&mon, Resources::single(mem_tag(), 40));
        }
        assert_eq!(mon.staged_total(mem_tag()), 0);
    }

    #[test]
    fn test_drop_does_not_free_committed() {
        let mon = monitor();
        let ticket;
        {
            let ctx = staged_context(&mon, Resources::single(mem_tag(), 40));
            ticket = ctx.ticket();
            ctx.alloc(ResourceType::Memory).commit();
        }
        // Committed resources survive the context.
        assert_eq!(mon.in_use(mem_tag()), 40);
        assert!(mon.ticket_exists(ticket));
    }

    #[test]
    fn test_display() {
        let mon = monitor();
        let ctx = staged_context(&mon, Resources::single(mem_tag(), 1));
        let shown = ctx.to_string();
        assert!(shown.contains("ticket#"));
        assert!(shown.contains("gpu:0"));
    }

    #[test]
    #[should_panic(expected = "valid ticket")]
    fn test_invalid_ticket_rejected() {
        let mon = monitor();
        let _ = ResourceContext::new(mon, 1, DeviceSpec::gpu(0), Ticket::INVALID);
    }
}
