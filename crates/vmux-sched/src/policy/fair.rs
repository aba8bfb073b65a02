//! Fair policy: rotate over sessions, one head dispatch per turn
//!
//! Every session gets an opportunity each iteration; the starting
//! point rotates so no session is systematically favored. A blocked
//! head triggers head-of-line bypass, capped by the configured
//! waiting limit.

use crate::engine::{DispatchOutcome, EngineCore};
use crate::policy::SchedulingPolicy;
use crate::session::{SessionChangeSet, SessionItem};
use std::sync::Arc;

/// Round-robin over sessions with head-of-line bypass
pub struct FairPolicy {
    core: Arc<EngineCore>,
    cursor: usize,
}

impl FairPolicy {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core, cursor: 0 }
    }
}

impl SchedulingPolicy for FairPolicy {
    fn name(&self) -> &'static str {
        "fair"
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
            DispatchOutcome::Empty => (0, false),
            DispatchOutcome::Dispatched => (1, false),
            DispatchOutcome::AdmissionFailed(tag) => (self.core.try_bypass(session, tag), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::core_with_sessions;

    #[test]
    fn test_rotation_changes_start() {
        let (core, sessions) = core_with_sessions(3);
        let mut policy = FairPolicy::new(core);
        let changes = SessionChangeSet::default();

        let first = policy.select_candidates(&sessions, &changes);
        let second = policy.select_candidates(&sessions, &changes);
        assert_eq!(first.len(), 3);
        assert_ne!(
            first[0].handle(),
            second[0].handle(),
            "rotation should move the head"
        );
    }

    #[test]
    fn test_empty_sessions() {
        let (core, _) = core_with_sessions(0);
        let mut policy = FairPolicy::new(core);
        let candidates = policy.select_candidates(&[], &SessionChangeSet::default());
        assert!(candidates.is_empty());
    }
}
