//! FIFO policy: drain sessions in submission order

use crate::engine::{DispatchOutcome, EngineCore};
use crate::policy::SchedulingPolicy;
use crate::session::{SessionChangeSet, SessionItem};
use std::sync::Arc;

/// Submission order across sessions, each drained fully
pub struct FifoPolicy {
    core: Arc<EngineCore>,
}

impl FifoPolicy {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }
}

impl SchedulingPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn select_candidates(
        &mut self,
        sessions: &[Arc<SessionItem>],
        _changes: &SessionChangeSet,
    ) -> Vec<Arc<SessionItem>> {
        let mut ordered: Vec<Arc<SessionItem>> = sessions.to_vec();
        ordered.sort_by_key(|s| s.insertion_seq());
        ordered
    }

    fn maybe_schedule_from(&mut self, session: &Arc<SessionItem>) -> (usize, bool) {
        match self.core.try_dispatch_head(session) {
            // Keep draining this session before moving on.
            DispatchOutcome::Dispatched => (1, !session.queue_empty()),
            DispatchOutcome::Empty | DispatchOutcome::AdmissionFailed(_) => (0, false),
        }
    }
}
