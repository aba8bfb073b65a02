//! Round-robin policy: exactly one task per session per turn

use crate::engine::{DispatchOutcome, EngineCore};
use crate::policy::SchedulingPolicy;
use crate::session::{SessionChangeSet, SessionItem};
use std::sync::Arc;

/// Strict round-robin, one admissible task per visit, no bypass
pub struct RrPolicy {
    core: Arc<EngineCore>,
    cursor: usize,
}

impl RrPolicy {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core, cursor: 0 }
    }
}

impl SchedulingPolicy for RrPolicy {
    fn name(&self) -> &'static str {
        "rr"
    }

    fn select_candidates(
        &mut self,
        sessions: &[Arc<SessionItem>],
        _changes: &SessionChangeSet,
    ) -> Vec<Arc<SessionItem>> {
        let mut ordered: Vec<Arc<SessionItem>> = sessions.to_vec();
        ordered.sort_by_key(|s| s.insertion_seq());
        if ordered.is_empty() {
            return ordered;
        }
        let start = self.cursor % ordered.len();
        self.cursor = self.cursor.wrapping_add(1);
        ordered.rotate_left(start);
        ordered
    }

    fn maybe_schedule_from(&mut self, session: &Arc<SessionItem>) -> (usize, bool) {
        match self.core.try_dispatch_head(session) {
            DispatchOutcome::Dispatched => (1, false),
            DispatchOutcome::Empty | DispatchOutcome::AdmissionFailed(_) => (0, false),
        }
    }
}
