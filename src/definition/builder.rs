use crate::behaviors::ActivityBehavior;
use crate::definition::{
    Activity, ActivityIdx, Condition, ProcessDefinition, TimerDeclaration, Transition,
};
use crate::error::{EngineError, Result};
use evalexpr::{Node as EvalNode, build_operator_tree};
use serde_json::Value;
use std::collections::HashMap;

/// Fluent builder for [`ProcessDefinition`]s. Nested scopes are declared
/// with closures over a [`ScopeBuilder`]; `build()` resolves ids to indexes
/// and validates the graph.
pub struct ProcessBuilder {
    id: String,
    name: String,
    activities: Vec<PendingActivity>,
    flows: Vec<PendingFlow>,
    timers: Vec<PendingTimer>,
    initial: Option<String>,
}

struct PendingActivity {
    id: String,
    behavior: ActivityBehavior,
    parent: Option<usize>,
}

struct PendingFlow {
    from: String,
    to: String,
    condition: Option<String>,
}

struct PendingTimer {
    on: String,
    id: String,
    interrupting: bool,
    duration_ms: u64,
    to: Vec<String>,
}

impl ProcessBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            activities: Vec::new(),
            flows: Vec::new(),
            timers: Vec::new(),
            initial: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn initial(mut self, id: &str) -> Self {
        self.initial = Some(id.to_string());
        self
    }

    pub fn task(mut self, id: &str) -> Self {
        self.insert(None, id, ActivityBehavior::Task { assignments: Vec::new() });
        self
    }

    /// A task that assigns a single variable when executed.
    pub fn assign(mut self, id: &str, var: &str, value: impl Into<Value>) -> Self {
        self.insert(
            None,
            id,
            ActivityBehavior::Task { assignments: vec![(var.to_string(), value.into())] },
        );
        self
    }

    pub fn wait_state(mut self, id: &str) -> Self {
        self.insert(None, id, ActivityBehavior::Wait);
        self
    }

    pub fn end_event(mut self, id: &str) -> Self {
        self.insert(None, id, ActivityBehavior::End);
        self
    }

    pub fn parallel_gateway(mut self, id: &str) -> Self {
        self.insert(None, id, ActivityBehavior::Parallel);
        self
    }

    pub fn exclusive_gateway(mut self, id: &str) -> Self {
        self.insert(None, id, ActivityBehavior::Exclusive);
        self
    }

    pub fn embedded(mut self, id: &str, scope: impl FnOnce(&mut ScopeBuilder)) -> Self {
        let parent = self.insert(None, id, ActivityBehavior::EmbeddedSubprocess);
        scope(&mut ScopeBuilder { builder: &mut self, parent });
        self
    }

    pub fn event_scope(mut self, id: &str, scope: impl FnOnce(&mut ScopeBuilder)) -> Self {
        let parent = self.insert(None, id, ActivityBehavior::EventScopeSubprocess);
        scope(&mut ScopeBuilder { builder: &mut self, parent });
        self
    }

    pub fn flow(mut self, from: &str, to: &str) -> Self {
        self.flows.push(PendingFlow {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
        });
        self
    }

    pub fn flow_if(mut self, from: &str, to: &str, condition: &str) -> Self {
        self.flows.push(PendingFlow {
            from: from.to_string(),
            to: to.to_string(),
            condition: Some(condition.to_string()),
        });
        self
    }

    /// Declare a boundary timer on a composite activity. `to` names the
    /// activities control continues at when the timer fires; they must be
    /// siblings of the composite.
    pub fn timer(
        mut self,
        on: &str,
        timer_id: &str,
        duration_ms: u64,
        interrupting: bool,
        to: &[&str],
    ) -> Self {
        self.timers.push(PendingTimer {
            on: on.to_string(),
            id: timer_id.to_string(),
            interrupting,
            duration_ms,
            to: to.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub(crate) fn insert(
        &mut self,
        parent: Option<usize>,
        id: &str,
        behavior: ActivityBehavior,
    ) -> usize {
        self.activities.push(PendingActivity {
            id: id.to_string(),
            behavior,
            parent,
        });
        self.activities.len() - 1
    }

    pub(crate) fn insert_flow(&mut self, from: &str, to: &str, condition: Option<String>) {
        self.flows.push(PendingFlow {
            from: from.to_string(),
            to: to.to_string(),
            condition,
        });
    }

    pub(crate) fn insert_timer(
        &mut self,
        on: &str,
        id: &str,
        interrupting: bool,
        duration_ms: u64,
        to: Vec<String>,
    ) {
        self.timers.push(PendingTimer {
            on: on.to_string(),
            id: id.to_string(),
            interrupting,
            duration_ms,
            to,
        });
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        if self.activities.is_empty() {
            return Err(EngineError::InvalidModel("process has no activities".into()));
        }

        // Pass 1: index by id.
        let mut index: HashMap<String, ActivityIdx> = HashMap::new();
        for (idx, pending) in self.activities.iter().enumerate() {
            if pending.id.is_empty() {
                return Err(EngineError::InvalidModel("empty activity id".into()));
            }
            if index.insert(pending.id.clone(), idx).is_some() {
                return Err(EngineError::InvalidModel(format!(
                    "duplicate activity id '{}'",
                    pending.id
                )));
            }
        }

        // Pass 2: transform to the index-addressed graph.
        let mut activities: Vec<Activity> = self
            .activities
            .iter()
            .map(|p| Activity {
                id: p.id.clone(),
                behavior: p.behavior.clone(),
                parent: p.parent,
                children: Vec::new(),
                incoming: 0,
                outgoing: Vec::new(),
                timers: Vec::new(),
            })
            .collect();

        for idx in 0..activities.len() {
            if let Some(parent) = activities[idx].parent {
                activities[parent].children.push(idx);
            }
        }

        for flow in &self.flows {
            let from = *index.get(&flow.from).ok_or_else(|| {
                EngineError::InvalidModel(format!("flow source '{}' does not exist", flow.from))
            })?;
            let to = *index.get(&flow.to).ok_or_else(|| {
                EngineError::InvalidModel(format!("flow target '{}' does not exist", flow.to))
            })?;
            if activities[from].parent != activities[to].parent {
                return Err(EngineError::InvalidModel(format!(
                    "flow '{}' -> '{}' crosses a scope boundary",
                    flow.from, flow.to
                )));
            }
            if matches!(activities[from].behavior, ActivityBehavior::End) {
                return Err(EngineError::InvalidModel(format!(
                    "end event '{}' must not have outgoing flows",
                    flow.from
                )));
            }
            let condition = match &flow.condition {
                None => None,
                Some(raw) => {
                    if !matches!(activities[from].behavior, ActivityBehavior::Exclusive) {
                        return Err(EngineError::InvalidModel(format!(
                            "condition on flow '{}' -> '{}': conditions are only valid on \
                             exclusive gateway flows",
                            flow.from, flow.to
                        )));
                    }
                    Some(Condition {
                        raw: raw.clone(),
                        compiled: compile_condition(raw)?,
                    })
                }
            };
            activities[from].outgoing.push(Transition { target: to, condition });
            activities[to].incoming += 1;
        }

        for timer in &self.timers {
            let on = *index.get(&timer.on).ok_or_else(|| {
                EngineError::InvalidModel(format!("timer host '{}' does not exist", timer.on))
            })?;
            if !activities[on].behavior.is_composite() {
                return Err(EngineError::InvalidModel(format!(
                    "timer '{}' declared on non-composite activity '{}'",
                    timer.id, timer.on
                )));
            }
            if timer.to.is_empty() {
                return Err(EngineError::InvalidModel(format!(
                    "timer '{}' on '{}' has no outgoing targets",
                    timer.id, timer.on
                )));
            }
            let mut outgoing = Vec::new();
            for target in &timer.to {
                let to = *index.get(target).ok_or_else(|| {
                    EngineError::InvalidModel(format!(
                        "timer target '{target}' does not exist"
                    ))
                })?;
                if activities[to].parent != activities[on].parent {
                    return Err(EngineError::InvalidModel(format!(
                        "timer '{}' target '{}' must be a sibling of '{}'",
                        timer.id, target, timer.on
                    )));
                }
                outgoing.push(to);
            }
            activities[on].timers.push(TimerDeclaration {
                id: timer.id.clone(),
                interrupting: timer.interrupting,
                duration_ms: timer.duration_ms,
                outgoing,
            });
        }

        // Pass 3: structural validation.
        for activity in &activities {
            match &activity.behavior {
                ActivityBehavior::Parallel | ActivityBehavior::Exclusive => {
                    if activity.outgoing.is_empty() {
                        return Err(EngineError::InvalidModel(format!(
                            "gateway '{}' has no outgoing flows",
                            activity.id
                        )));
                    }
                }
                b if b.is_composite() => {
                    if activity.children.is_empty() {
                        return Err(EngineError::InvalidModel(format!(
                            "composite activity '{}' is empty",
                            activity.id
                        )));
                    }
                    let has_entry = activity
                        .children
                        .iter()
                        .any(|&c| activities[c].incoming == 0);
                    if !has_entry {
                        return Err(EngineError::InvalidModel(format!(
                            "composite activity '{}' has no entry activity \
                             (every nested activity has incoming flows)",
                            activity.id
                        )));
                    }
                }
                _ => {}
            }
        }

        let initial = match &self.initial {
            Some(id) => *index.get(id).ok_or_else(|| {
                EngineError::InvalidModel(format!("initial activity '{id}' does not exist"))
            })?,
            None => self
                .activities
                .iter()
                .position(|p| p.parent.is_none())
                .ok_or_else(|| {
                    EngineError::InvalidModel("process has no top-level activity".into())
                })?,
        };
        if activities[initial].parent.is_some() {
            return Err(EngineError::InvalidModel(format!(
                "initial activity '{}' must be top-level",
                activities[initial].id
            )));
        }

        Ok(ProcessDefinition {
            id: self.id,
            name: self.name,
            activities,
            initial,
        })
    }
}

/// Builder view scoped to one composite activity; pushed activities become
/// its nested children.
pub struct ScopeBuilder<'a> {
    builder: &'a mut ProcessBuilder,
    parent: usize,
}

impl ScopeBuilder<'_> {
    pub fn task(&mut self, id: &str) -> &mut Self {
        self.builder
            .insert(Some(self.parent), id, ActivityBehavior::Task { assignments: Vec::new() });
        self
    }

    pub fn assign(&mut self, id: &str, var: &str, value: impl Into<Value>) -> &mut Self {
        self.builder.insert(
            Some(self.parent),
            id,
            ActivityBehavior::Task { assignments: vec![(var.to_string(), value.into())] },
        );
        self
    }

    pub fn wait_state(&mut self, id: &str) -> &mut Self {
        self.builder.insert(Some(self.parent), id, ActivityBehavior::Wait);
        self
    }

    pub fn end_event(&mut self, id: &str) -> &mut Self {
        self.builder.insert(Some(self.parent), id, ActivityBehavior::End);
        self
    }

    pub fn parallel_gateway(&mut self, id: &str) -> &mut Self {
        self.builder.insert(Some(self.parent), id, ActivityBehavior::Parallel);
        self
    }

    pub fn exclusive_gateway(&mut self, id: &str) -> &mut Self {
        self.builder.insert(Some(self.parent), id, ActivityBehavior::Exclusive);
        self
    }

    pub fn embedded(&mut self, id: &str, scope: impl FnOnce(&mut ScopeBuilder)) -> &mut Self {
        let parent = self
            .builder
            .insert(Some(self.parent), id, ActivityBehavior::EmbeddedSubprocess);
        scope(&mut ScopeBuilder { builder: self.builder, parent });
        self
    }

    pub fn event_scope(&mut self, id: &str, scope: impl FnOnce(&mut ScopeBuilder)) -> &mut Self {
        let parent = self
            .builder
            .insert(Some(self.parent), id, ActivityBehavior::EventScopeSubprocess);
        scope(&mut ScopeBuilder { builder: self.builder, parent });
        self
    }

    pub fn flow(&mut self, from: &str, to: &str) -> &mut Self {
        self.builder.insert_flow(from, to, None);
        self
    }

    pub fn flow_if(&mut self, from: &str, to: &str, condition: &str) -> &mut Self {
        self.builder.insert_flow(from, to, Some(condition.to_string()));
        self
    }

    pub fn timer(
        &mut self,
        on: &str,
        timer_id: &str,
        duration_ms: u64,
        interrupting: bool,
        to: &[&str],
    ) -> &mut Self {
        self.builder.insert_timer(
            on,
            timer_id,
            interrupting,
            duration_ms,
            to.iter().map(|s| s.to_string()).collect(),
        );
        self
    }
}

fn compile_condition(raw: &str) -> Result<EvalNode> {
    let cleaned = raw.replace("${", "").replace('}', "");
    build_operator_tree(&cleaned)
        .map_err(|e| EngineError::InvalidModel(format!("condition '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_id_rejected() {
        let result = ProcessBuilder::new("p")
            .task("a")
            .task("a")
            .build();
        assert!(matches!(result, Err(EngineError::InvalidModel(_))));
    }

    #[test]
    fn flow_across_scope_boundary_rejected() {
        let result = ProcessBuilder::new("p")
            .task("outside")
            .embedded("sub", |s| {
                s.wait_state("inside");
            })
            .flow("outside", "inside")
            .build();
        assert!(matches!(result, Err(EngineError::InvalidModel(_))));
    }

    #[test]
    fn composite_without_entry_rejected() {
        let result = ProcessBuilder::new("p")
            .embedded("sub", |s| {
                s.task("a").task("b").flow("a", "b").flow("b", "a");
            })
            .build();
        assert!(matches!(result, Err(EngineError::InvalidModel(_))));
    }

    #[test]
    fn end_event_with_outgoing_rejected() {
        let result = ProcessBuilder::new("p")
            .end_event("end")
            .task("after")
            .flow("end", "after")
            .build();
        assert!(matches!(result, Err(EngineError::InvalidModel(_))));
    }

    #[test]
    fn condition_on_non_exclusive_flow_rejected() {
        let result = ProcessBuilder::new("p")
            .task("a")
            .task("b")
            .flow_if("a", "b", "x > 1")
            .build();
        assert!(matches!(result, Err(EngineError::InvalidModel(_))));
    }

    #[test]
    fn timer_without_targets_rejected() {
        let result = ProcessBuilder::new("p")
            .embedded("sub", |s| {
                s.wait_state("w");
            })
            .timer("sub", "deadline", 1_000, true, &[])
            .build();
        assert!(matches!(result, Err(EngineError::InvalidModel(_))));
    }

    #[test]
    fn incoming_counts_and_entries_resolved() {
        let def = ProcessBuilder::new("p")
            .task("start")
            .parallel_gateway("join")
            .task("x")
            .flow("start", "join")
            .flow("x", "join")
            .flow("join", "x")
            .build()
            .expect("valid model");
        let join = def.find_activity("join").unwrap();
        assert_eq!(def.activity(join).incoming, 2);
        assert_eq!(def.activity(join).outgoing.len(), 1);
    }
}
