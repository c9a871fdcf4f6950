pub mod gateway;
pub mod subprocess;

use serde_json::Value;

/// The behavior attached to an activity. One variant per node kind; the
/// runtime dispatches over this with explicit matching instead of a trait
/// hierarchy, and capability predicates replace marker interfaces.
#[derive(Debug, Clone)]
pub enum ActivityBehavior {
    /// Applies its variable assignments, then leaves along all outgoing
    /// transitions (several outgoing transitions fork implicitly).
    Task { assignments: Vec<(String, Value)> },
    /// Parks the token until an external trigger resumes it.
    Wait,
    /// Ends the arriving execution.
    End,
    /// Condition-guarded routing; the first matching flow wins, an
    /// unconditional flow acts as the default.
    Exclusive,
    /// Parallel gateway: joins concurrent arrivals, forks on firing.
    Parallel,
    /// Composite scope; ending its last child ends or leaves the scope.
    EmbeddedSubprocess,
    /// Composite scope that leaves a dormant event-scope anchor behind
    /// when it completes.
    EventScopeSubprocess,
}

impl ActivityBehavior {
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            ActivityBehavior::EmbeddedSubprocess | ActivityBehavior::EventScopeSubprocess
        )
    }

    pub fn is_wait_state(&self) -> bool {
        matches!(self, ActivityBehavior::Wait)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ActivityBehavior::Task { .. } => "task",
            ActivityBehavior::Wait => "wait",
            ActivityBehavior::End => "end",
            ActivityBehavior::Exclusive => "exclusive",
            ActivityBehavior::Parallel => "parallel",
            ActivityBehavior::EmbeddedSubprocess => "subprocess",
            ActivityBehavior::EventScopeSubprocess => "event-subprocess",
        }
    }
}
