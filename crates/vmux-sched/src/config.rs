//! Scheduling parameters

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Which built-in policy drives candidate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Round-robin with head-of-line bypass
    Fair,
    /// Newest session first, older sessions suspended
    Preempt,
    /// Sessions by decreasing footprint, greedy per session
    #[default]
    Pack,
    /// Strict round-robin, one task per session per turn
    Rr,
    /// Sessions in submission order, drained fully
    Fifo,
}

impl PolicyKind {
    /// Policy name as used in configuration
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            PolicyKind::Fair => "fair",
            PolicyKind::Preempt => "preempt",
            PolicyKind::Pack => "pack",
            PolicyKind::Rr => "rr",
            PolicyKind::Fifo => "fifo",
        }
    }

    /// Parse a policy name, falling back to `pack` with a warning
    ///
    /// Disabling fairness historically meant packing, so unknown
    /// inputs collapse to the packing policy rather than failing.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "fair" => PolicyKind::Fair,
            "preempt" => PolicyKind::Preempt,
            "pack" => PolicyKind::Pack,
            "rr" => PolicyKind::Rr,
            "fifo" => PolicyKind::Fifo,
            other => {
                warn!(policy = other, "unknown scheduling policy, using pack");
                PolicyKind::Pack
            }
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tunable scheduling parameters
///
/// Swapped atomically through
/// [`ExecutionEngine::set_scheduling_param`](crate::ExecutionEngine::set_scheduling_param);
/// the new values take effect on the next scheduling iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingParam {
    /// Maximum number of tasks allowed to go past a blocked queue head
    pub max_hol_waiting: u64,
    /// Keep scheduling admissible tasks while the head is blocked
    pub work_conservative: bool,
    /// Active scheduling policy
    pub policy: PolicyKind,
}

impl Default for SchedulingParam {
    fn default() -> Self {
        Self {
            max_hol_waiting: 50,
            work_conservative: true,
            policy: PolicyKind::Pack,
        }
    }
}

impl SchedulingParam {
    /// Builder: set the head-of-line waiting cap
    #[must_use]
    pub const fn with_max_hol_waiting(mut self, max: u64) -> Self {
        self.max_hol_waiting = max;
        self
    }

    /// Builder: toggle work conservation
    #[must_use]
    pub const fn with_work_conservative(mut self, on: bool) -> Self {
        self.work_conservative = on;
        self
    }

    /// Builder: choose the policy
    #[must_use]
    pub const fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }
}
