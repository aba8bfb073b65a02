//! Allocation event fan-out
//!
//! Commits and frees on a [`ResourceContext`](crate::ResourceContext)
//! are reported to a small closed set of sinks. Sinks are invoked after
//! the monitor lock has been released and must not call back into the
//! context synchronously.

use crate::types::{ResourceTag, Ticket};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Where allocation events are delivered
#[derive(Debug, Clone)]
pub enum AllocationSink {
    /// Log every event at debug level
    Log,
    /// Accumulate per-graph usage statistics
    Stats(Arc<AllocStats>),
}

impl AllocationSink {
    /// Report a committed allocation
    pub fn notify_alloc(&self, graph_id: u64, ticket: Ticket, tag: ResourceTag, amount: u64) {
        match self {
            AllocationSink::Log => {
                debug!(graph_id, %ticket, %tag, amount, "alloc");
            }
            AllocationSink::Stats(stats) => stats.record_alloc(graph_id, tag, amount),
        }
    }

    /// Report a freed allocation
    ///
    /// `last` is true when the free removed the ticket's final
    /// commitment.
    pub fn notify_dealloc(
        &self,
        graph_id: u64,
        ticket: Ticket,
        tag: ResourceTag,
        amount: u64,
        last: bool,
    ) {
        match self {
            AllocationSink::Log => {
                debug!(graph_id, %ticket, %tag, amount, last, "dealloc");
            }
            AllocationSink::Stats(stats) => stats.record_dealloc(graph_id, tag, amount),
        }
    }
}

/// Usage counters for one (graph, tag) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphUsage {
    /// Currently held amount
    pub current: u64,
    /// High-water mark
    pub peak: u64,
}

/// Per-graph allocation statistics
///
/// Cheap enough to attach to every resource context; readers take a
/// snapshot without blocking writers for long.
#[derive(Debug, Default)]
pub struct AllocStats {
    usage: RwLock<HashMap<(u64, ResourceTag), GraphUsage>>,
}

impl AllocStats {
    /// Create an empty stats accumulator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_alloc(&self, graph_id: u64, tag: ResourceTag, amount: u64) {
        let mut usage = self.usage.write();
        let entry = usage.entry((graph_id, tag)).or_default();
        entry.current += amount;
        entry.peak = entry.peak.max(entry.current);
    }

    fn record_dealloc(&self, graph_id: u64, tag: ResourceTag, amount: u64) {
        let mut usage = self.usage.write();
        if let Some(entry) = usage.get_mut(&(graph_id, tag)) {
            entry.current = entry.current.saturating_sub(amount);
        }
    }

    /// Usage snapshot for one graph and tag
    #[must_use]
    pub fn usage(&self, graph_id: u64, tag: ResourceTag) -> GraphUsage {
        self.usage
            .read()
            .get(&(graph_id, tag))
            .copied()
            .unwrap_or_default()
    }

    /// Sum of current usage across graphs for a tag
    #[must_use]
    pub fn current_total(&self, tag: ResourceTag) -> u64 {
        self.usage
            .read()
            .iter()
            .filter(|((_, t), _)| *t == tag)
            .map(|(_, u)| u.current)
            .sum()
    }
}
