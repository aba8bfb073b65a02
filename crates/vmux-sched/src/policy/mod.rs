//! Scheduling policies
//!
//! A policy answers two questions per iteration: which sessions
//! deserve a scheduling opportunity, in what order, and how far to
//! advance each one. Policies hold a handle back to the engine core
//! for admission and configuration; the engine owns the policy
//! instance and rebuilds it when the configured kind changes.

mod fair;
mod fifo;
mod pack;
mod preempt;
mod rr;

pub use fair::FairPolicy;
pub use fifo::FifoPolicy;
pub use pack::PackPolicy;
pub use preempt::PreemptPolicy;
pub use rr::RrPolicy;

use crate::config::PolicyKind;
use crate::engine::EngineCore;
use crate::session::{SessionChangeSet, SessionItem};
use std::sync::Arc;

/// Policy plugin interface
pub trait SchedulingPolicy: Send {
    /// Policy name, matching its configuration name
    fn name(&self) -> &'static str;

    /// Ordered subset of sessions to offer a scheduling opportunity
    fn select_candidates(
        &mut self,
        sessions: &[Arc<SessionItem>],
        changes: &SessionChangeSet,
    ) -> Vec<Arc<SessionItem>>;

    /// Try to advance tasks in one session
    ///
    /// Returns how many tasks were dispatched and whether the engine
    /// should keep iterating this session in the same turn.
    fn maybe_schedule_from(&mut self, session: &Arc<SessionItem>) -> (usize, bool);
}

/// Instantiate the built-in policy for a kind
pub(crate) fn make_policy(kind: PolicyKind, core: Arc<EngineCore>) -> Box<dyn SchedulingPolicy> {
    match kind {
        PolicyKind::Fair => Box::new(FairPolicy::new(core)),
        PolicyKind::Preempt => Box::new(PreemptPolicy::new(core)),
        PolicyKind::Pack => Box::new(PackPolicy::new(core)),
        PolicyKind::Rr => Box::new(RrPolicy::new(core)),
        PolicyKind::Fifo => Box::new(FifoPolicy::new(core)),
    }
}
