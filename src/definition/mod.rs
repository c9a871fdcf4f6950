pub mod builder;
pub mod loader;

use crate::behaviors::ActivityBehavior;
use evalexpr::Node as EvalNode;

/// Index of an activity inside its [`ProcessDefinition`].
pub type ActivityIdx = usize;

/// A compiled, index-addressed activity graph. Produced by
/// [`builder::ProcessBuilder`] (or the YAML loader on top of it) and shared
/// immutably between all process instances.
#[derive(Debug)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub(crate) activities: Vec<Activity>,
    pub(crate) initial: ActivityIdx,
}

#[derive(Debug)]
pub struct Activity {
    pub id: String,
    pub behavior: ActivityBehavior,
    pub(crate) parent: Option<ActivityIdx>,
    pub(crate) children: Vec<ActivityIdx>,
    /// Number of declared incoming transitions; the join requirement for
    /// parallel gateways.
    pub(crate) incoming: usize,
    pub(crate) outgoing: Vec<Transition>,
    pub(crate) timers: Vec<TimerDeclaration>,
}

#[derive(Debug)]
pub struct Transition {
    pub(crate) target: ActivityIdx,
    pub(crate) condition: Option<Condition>,
}

/// A precompiled transition guard, only valid on exclusive-gateway outgoing
/// flows.
#[derive(Debug)]
pub(crate) struct Condition {
    pub(crate) raw: String,
    pub(crate) compiled: EvalNode,
}

/// A boundary timer declared on a composite activity. Firing routes control
/// to `outgoing`; interrupting timers cancel the scope's live subtree first.
#[derive(Debug)]
pub struct TimerDeclaration {
    pub id: String,
    pub interrupting: bool,
    pub duration_ms: u64,
    pub(crate) outgoing: Vec<ActivityIdx>,
}

impl ProcessDefinition {
    pub(crate) fn activity(&self, idx: ActivityIdx) -> &Activity {
        &self.activities[idx]
    }

    pub fn initial(&self) -> ActivityIdx {
        self.initial
    }

    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }

    pub fn find_activity(&self, id: &str) -> Option<ActivityIdx> {
        self.activities.iter().position(|a| a.id == id)
    }

    pub fn activity_id(&self, idx: ActivityIdx) -> &str {
        &self.activities[idx].id
    }
}

impl Activity {
    /// Targets of all unconditional takes, in declaration order.
    pub(crate) fn outgoing_targets(&self) -> Vec<ActivityIdx> {
        self.outgoing.iter().map(|t| t.target).collect()
    }

    /// Nested activities with zero incoming transitions; where tokens enter
    /// a composite.
    pub(crate) fn entry_activities<'a>(
        &'a self,
        definition: &'a ProcessDefinition,
    ) -> Vec<ActivityIdx> {
        self.children
            .iter()
            .copied()
            .filter(|&c| definition.activity(c).incoming == 0)
            .collect()
    }

    pub(crate) fn timer(&self, timer_id: &str) -> Option<&TimerDeclaration> {
        self.timers.iter().find(|t| t.id == timer_id)
    }
}
