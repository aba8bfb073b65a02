//! Pack policy: largest sessions first, greedy per session
//!
//! Sessions are visited by decreasing committed resource footprint
//! and each one packs tasks until admission fails. Small sessions can
//! starve under sustained load from large ones; that is the point of
//! packing, not a defect.

use crate::engine::{DispatchOutcome, EngineCore};
use crate::policy::SchedulingPolicy;
use crate::session::{SessionChangeSet, SessionItem};
use std::sync::Arc;

/// Decreasing-footprint order, greedy packing within a session
pub struct PackPolicy {
    core: Arc<EngineCore>,
}

impl PackPolicy {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }
}

impl SchedulingPolicy for PackPolicy {
    fn name(&self) -> &'static str {
        "pack"
    }

    fn select_candidates(
        &mut self,
        sessions: &[Arc<SessionItem>],
        _changes: &SessionChangeSet,
    ) -> Vec<Arc<SessionItem>> {
        let monitor = self.core.monitor();
        let mut ordered: Vec<Arc<SessionItem>> = sessions.to_vec();
        // Footprint descending; insertion order breaks ties.
        ordered.sort_by_key(|s| (std::cmp::Reverse(s.footprint(monitor)), s.insertion_seq()));
        ordered
    }

    fn maybe_schedule_from(&mut self, session: &Arc<SessionItem>) -> (usize, bool) {
        match self.core.try_dispatch_head(session) {
            DispatchOutcome::Dispatched => (1, true),
            DispatchOutcome::Empty | DispatchOutcome::AdmissionFailed(_) => (0, false),
        }
    }
}
