//! Resource monitor: two-phase admission over typed per-device capacities
//!
//! The monitor keeps four tables: configured `capacity`, committed
//! `in_use`, and per-ticket `staging` and `committed` vectors. Staged
//! reservations count against capacity exactly like committed
//! allocations, so admission (`mint_staging`) is the only place a
//! request can be refused; a later commit drawn from staging cannot
//! fail.
//!
//! All mutation happens behind one coarse mutex obtained through
//! [`ResourceMonitor::lock`]. Callers that need several operations to be
//! atomic (query staging, then commit) hold the returned proxy across
//! them.

use crate::types::{ResourceTag, Resources, Ticket};
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Tables {
    capacity: BTreeMap<ResourceTag, u64>,
    in_use: BTreeMap<ResourceTag, u64>,
    staging: HashMap<Ticket, Resources>,
    committed: HashMap<Ticket, Resources>,
    /// Tickets registered with an explicitly empty reservation
    preallocated: HashSet<Ticket>,
}

impl Tables {
    fn capacity(&self, tag: ResourceTag) -> u64 {
        self.capacity.get(&tag).copied().unwrap_or(0)
    }

    fn in_use(&self, tag: ResourceTag) -> u64 {
        self.in_use.get(&tag).copied().unwrap_or(0)
    }

    fn staged_total(&self, tag: ResourceTag) -> u64 {
        self.staging.values().map(|res| res.get(tag)).sum()
    }

    /// Capacity not claimed by any committed or staged reservation
    fn available(&self, tag: ResourceTag) -> u64 {
        self.capacity(tag)
            .saturating_sub(self.in_use(tag))
            .saturating_sub(self.staged_total(tag))
    }
}

/// Typed capacity accounting per device, keyed by ticket
///
/// Shared across the engine, sessions and per-task devices as an
/// `Arc<ResourceMonitor>`; the monitor outlives every context that
/// borrows it.
#[derive(Debug)]
pub struct ResourceMonitor {
    tables: Mutex<Tables>,
    // Tickets are minted outside the table lock; monotonicity is all
    // that matters, not ordering relative to table updates.
    next_ticket: AtomicU64,
}

impl ResourceMonitor {
    /// Create a monitor with the given configured capacities
    #[must_use]
    pub fn new(capacity: Resources) -> Self {
        let mut tables = Tables::default();
        for (tag, amount) in capacity.iter() {
            tables.capacity.insert(tag, amount);
        }
        Self {
            tables: Mutex::new(tables),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Acquire the monitor lock
    ///
    /// All allocate/free/query operations on the returned proxy are
    /// serialized with every other monitor operation.
    pub fn lock(&self) -> MonitorProxy<'_> {
        MonitorProxy {
            tables: self.tables.lock(),
        }
    }

    /// Atomically test and reserve a staging ticket for `req`
    ///
    /// Checks `in_use + staged + req <= capacity` for every tag in the
    /// request; on success mints a fresh ticket and records the request
    /// as staged under it. The error names the first tag that failed.
    pub fn mint_staging(&self, req: &Resources) -> Result<Ticket> {
        let mut tables = self.tables.lock();

        for (tag, requested) in req.iter() {
            let available = tables.available(tag);
            if requested > available {
                debug!(%tag, requested, available, "staging request refused");
                return Err(Error::OutOfCapacity {
                    tag,
                    requested,
                    available,
                });
            }
        }

        let ticket = self.mint_ticket();
        if req.is_empty() {
            tables.preallocated.insert(ticket);
        } else {
            tables.staging.insert(ticket, req.clone());
        }
        trace!(%ticket, req = %req, "staging reserved");
        Ok(ticket)
    }

    /// Register a ticket ahead of use, possibly with an empty reservation
    ///
    /// Used at session setup so that a session owns a ticket before its
    /// first task is admitted. Capacity rules are identical to
    /// [`mint_staging`](Self::mint_staging).
    pub fn preallocate(&self, req: &Resources) -> Result<Ticket> {
        let ticket = self.mint_staging(req)?;
        let mut tables = self.tables.lock();
        tables.preallocated.insert(ticket);
        Ok(ticket)
    }

    /// Commit resources against a ticket; see [`MonitorProxy::allocate`]
    pub fn allocate(&self, ticket: Ticket, res: &Resources) -> bool {
        self.lock().allocate(ticket, res)
    }

    /// Free committed resources; see [`MonitorProxy::free`]
    pub fn free(&self, ticket: Ticket, res: &Resources) -> bool {
        self.lock().free(ticket, res)
    }

    /// Discard any staging still recorded for a ticket
    ///
    /// Idempotent: releasing an already-released ticket is a no-op. If
    /// no committed entries remain either, the ticket record is erased.
    pub fn free_staging(&self, ticket: Ticket) {
        let mut tables = self.tables.lock();
        if tables.staging.remove(&ticket).is_some() {
            trace!(%ticket, "staging released");
        }
        if !tables.committed.contains_key(&ticket) {
            tables.preallocated.remove(&ticket);
        }
    }

    /// Free everything attributed to a ticket: staging and committed
    ///
    /// Returns the committed resources that were released. Used at
    /// session teardown.
    pub fn release_ticket(&self, ticket: Ticket) -> Resources {
        let mut tables = self.tables.lock();
        tables.staging.remove(&ticket);
        tables.preallocated.remove(&ticket);
        let committed = tables.committed.remove(&ticket).unwrap_or_default();
        for (tag, amount) in committed.iter() {
            let used = tables.in_use(tag);
            assert!(
                used >= amount,
                "in_use underflow while releasing {ticket}: {tag} has {used}, freeing {amount}"
            );
            let remaining = used - amount;
            if remaining == 0 {
                tables.in_use.remove(&tag);
            } else {
                tables.in_use.insert(tag, remaining);
            }
        }
        if !committed.is_empty() {
            debug!(%ticket, released = %committed, "ticket released");
        }
        committed
    }

    /// Configured capacity for a tag
    pub fn capacity(&self, tag: ResourceTag) -> u64 {
        self.tables.lock().capacity(tag)
    }

    /// Committed usage for a tag across all tickets
    pub fn in_use(&self, tag: ResourceTag) -> u64 {
        self.tables.lock().in_use(tag)
    }

    /// Total staged amount for a tag across all tickets
    pub fn staged_total(&self, tag: ResourceTag) -> u64 {
        self.tables.lock().staged_total(tag)
    }

    /// Staged vector for a ticket, if any
    pub fn staged(&self, ticket: Ticket) -> Option<Resources> {
        self.tables.lock().staging.get(&ticket).cloned()
    }

    /// Committed vector for a ticket, if any
    pub fn committed(&self, ticket: Ticket) -> Option<Resources> {
        self.tables.lock().committed.get(&ticket).cloned()
    }

    /// True while the ticket has staging, commitments, or was preallocated
    pub fn ticket_exists(&self, ticket: Ticket) -> bool {
        let tables = self.tables.lock();
        tables.staging.contains_key(&ticket)
            || tables.committed.contains_key(&ticket)
            || tables.preallocated.contains(&ticket)
    }

    fn mint_ticket(&self) -> Ticket {
        // Relaxed: the counter only needs to be unique and increasing.
        Ticket::from_raw(self.next_ticket.fetch_add(1, Ordering::Relaxed))
    }
}

/// Exclusive handle over the monitor tables
///
/// Holding the proxy serializes every monitor operation; callers must
/// not re-enter the monitor while holding it.
pub struct MonitorProxy<'a> {
    tables: MutexGuard<'a, Tables>,
}

impl MonitorProxy<'_> {
    /// Staged amount recorded for `(ticket, tag)`, if any
    ///
    /// Zero entries are equivalent to absent entries and read as `None`.
    #[must_use]
    pub fn query_staging(&self, ticket: Ticket, tag: ResourceTag) -> Option<u64> {
        self.tables
            .staging
            .get(&ticket)
            .map(|res| res.get(tag))
            .filter(|amount| *amount > 0)
    }

    /// Convert staging into committed allocations, all-or-nothing
    ///
    /// For each tag the requested amount is drawn from the ticket's
    /// staging first (saturating at zero) and any remainder from free
    /// capacity. If any tag cannot be satisfied the monitor commits
    /// nothing and returns `false`.
    pub fn allocate(&mut self, ticket: Ticket, res: &Resources) -> bool {
        debug_assert!(ticket.is_valid(), "allocate on the invalid ticket");

        // Feasibility pass: nothing is mutated until every tag fits.
        for (tag, requested) in res.iter() {
            let staged = self
                .tables
                .staging
                .get(&ticket)
                .map(|s| s.get(tag))
                .unwrap_or(0);
            let beyond_staging = requested.saturating_sub(staged);
            if beyond_staging > self.tables.available(tag) {
                debug!(%ticket, %tag, requested, staged, "allocation refused");
                return false;
            }
        }

        for (tag, requested) in res.iter() {
            if let Some(staged) = self.tables.staging.get_mut(&ticket) {
                staged.sub_saturating(tag, requested);
            }
            self.tables
                .committed
                .entry(ticket)
                .or_default()
                .add(tag, requested);
            *self.tables.in_use.entry(tag).or_insert(0) += requested;
        }
        if let Some(staged) = self.tables.staging.get(&ticket) {
            if staged.is_empty() {
                self.tables.staging.remove(&ticket);
            }
        }
        trace!(%ticket, res = %res, "allocation committed");
        true
    }

    /// Release committed resources for a ticket
    ///
    /// Returns `true` when this call removed the ticket's last
    /// commitment. Freeing more than was committed is a programming
    /// error and panics.
    pub fn free(&mut self, ticket: Ticket, res: &Resources) -> bool {
        for (tag, amount) in res.iter() {
            let committed = self
                .tables
                .committed
                .get_mut(&ticket)
                .unwrap_or_else(|| panic!("free on {ticket} with no commitments"));
            let current = committed.get(tag);
            assert!(
                current >= amount,
                "commitment underflow for {ticket}: {tag} has {current}, freeing {amount}"
            );
            committed.set(tag, current - amount);

            let used = self.tables.in_use(tag);
            assert!(
                used >= amount,
                "in_use underflow: {tag} has {used}, freeing {amount}"
            );
            let remaining = used - amount;
            if remaining == 0 {
                self.tables.in_use.remove(&tag);
            } else {
                self.tables.in_use.insert(tag, remaining);
            }
        }

        let last = self
            .tables
            .committed
            .get(&ticket)
            .map(Resources::is_empty)
            .unwrap_or(true);
        if last {
            self.tables.committed.remove(&ticket);
            if !self.tables.staging.contains_key(&ticket) {
                self.tables.preallocated.remove(&ticket);
            }
            trace!(%ticket, "last commitment freed");
        }
        last
    }
}

static_assertions::assert_impl_all!(ResourceMonitor: Send, Sync);
