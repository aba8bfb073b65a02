//! Preempt policy: the newest session always wins
//!
//! New sessions get strictly higher priority than old ones. While any
//! newer session has runnable tasks, older sessions contribute zero
//! tasks; they resume once the newer session drains.

use crate::engine::{DispatchOutcome, EngineCore};
use crate::policy::SchedulingPolicy;
use crate::session::{SessionChangeSet, SessionItem};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Newest-session-first with suspension of older sessions
pub struct PreemptPolicy {
    core: Arc<EngineCore>,
    /// Priority per session handle; newer sessions get larger values
    priorities: HashMap<String, u64>,
    /// Handle of the session allowed to schedule this iteration
    active: Option<String>,
}

impl PreemptPolicy {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self {
            core,
            priorities: HashMap::new(),
            active: None,
        }
    }
}

impl SchedulingPolicy for PreemptPolicy {
    fn name(&self) -> &'static str {
        "preempt"
    }

    fn select_candidates(
        &mut self,
        sessions: &[Arc<SessionItem>],
        changes: &SessionChangeSet,
    ) -> Vec<Arc<SessionItem>> {
        for handle in &changes.removed {
            self.priorities.remove(handle);
        }
        for session in sessions {
            self.priorities
                .entry(session.handle().to_string())
                .or_insert(session.insertion_seq());
        }

        let mut ordered: Vec<Arc<SessionItem>> = sessions.to_vec();
        ordered.sort_by_key(|s| {
            std::cmp::Reverse(self.priorities.get(s.handle()).copied().unwrap_or(0))
        });

        // The newest session with runnable tasks suspends the rest.
        self.active = ordered
            .iter()
            .find(|s| !s.queue_empty())
            .map(|s| s.handle().to_string());
        if let Some(active) = &self.active {
            trace!(session = active.as_str(), "preempt winner");
        }
        ordered
    }

    fn maybe_schedule_from(&mut self, session: &Arc<SessionItem>) -> (usize, bool) {
        if self.active.as_deref() != Some(session.handle()) {
            return (0, false);
        }
        match self.core.try_dispatch_head(session) {
            DispatchOutcome::Empty => (0, false),
            DispatchOutcome::Dispatched => (1, !session.queue_empty()),
            DispatchOutcome::AdmissionFailed(tag) => (self.core.try_bypass(session, tag), false),
        }
    }
}
