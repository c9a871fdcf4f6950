use crate::behaviors::{ActivityBehavior, gateway, subprocess};
use crate::definition::{ActivityIdx, ProcessDefinition};
use crate::error::{EngineError, Result};
use crate::runtime::events::EngineEvent;
use crate::runtime::tree::{ExecutionId, ExecutionNode, ExecutionTree};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

/// Upper bound on activity dispatches per command; a guard against models
/// that cycle without ever reaching a wait state.
const MAX_STEPS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Active,
    Completed,
}

/// A registered boundary timer waiting to fire on a composite scope.
#[derive(Debug, Clone)]
pub struct TimerSubscription {
    pub execution: ExecutionId,
    pub timer: String,
    pub due_at_ms: u64,
    pub interrupting: bool,
}

/// One running process instance: the execution tree plus the work queue
/// that interleaves its tokens. Every public operation is a synchronous
/// command that runs the graph walk to completion before returning.
pub struct ProcessInstance {
    id: Uuid,
    definition: Arc<ProcessDefinition>,
    pub(crate) tree: ExecutionTree,
    pub(crate) root: ExecutionId,
    pub(crate) queue: VecDeque<ExecutionId>,
    state: InstanceState,
    pub(crate) subscriptions: Vec<TimerSubscription>,
    pub(crate) events: Vec<EngineEvent>,
    /// Snapshot of the root scope's variables, taken when the instance
    /// completes so results stay readable after the tree is gone.
    final_variables: HashMap<String, Value>,
}

impl ProcessInstance {
    /// Creates the root execution at the definition's initial activity and
    /// runs until all tokens park or the instance completes.
    pub fn start(
        definition: Arc<ProcessDefinition>,
        initial_vars: HashMap<String, Value>,
    ) -> Result<Self> {
        let mut tree = ExecutionTree::new();
        let root = tree.create_root();
        for (k, v) in initial_vars {
            tree.set_variable_local(root, &k, v);
        }
        tree.set_activity(root, definition.initial());

        let mut instance = Self {
            id: Uuid::new_v4(),
            definition: definition.clone(),
            tree,
            root,
            queue: VecDeque::new(),
            state: InstanceState::Active,
            subscriptions: Vec::new(),
            events: Vec::new(),
            final_variables: HashMap::new(),
        };
        info!(instance_id = %instance.id, definition = %definition.id, "starting process instance");
        instance.events.push(EngineEvent::InstanceStarted {
            definition: definition.id.clone(),
        });
        instance
            .events
            .push(EngineEvent::ExecutionCreated { execution: root, parent: None });
        instance.queue.push_back(root);
        instance.run()?;
        Ok(instance)
    }

    /// Resumes an execution parked at a wait state, applying the given
    /// variable writes first.
    pub fn trigger(&mut self, exec: ExecutionId, vars: HashMap<String, Value>) -> Result<()> {
        self.ensure_active()?;
        let node = self.tree.get(exec).ok_or(EngineError::UnknownExecution(exec))?;
        let at_wait = node
            .activity
            .is_some_and(|a| self.definition.activity(a).behavior.is_wait_state());
        if !node.is_active || node.is_event_scope || !at_wait {
            return Err(EngineError::NotWaiting(exec));
        }
        for (k, v) in vars {
            self.write_variable(exec, &k, v);
        }
        self.events.push(EngineEvent::TriggerReceived { execution: exec });
        debug!(instance_id = %self.id, execution = %exec, "trigger received");
        self.leave(exec)?;
        self.run()
    }

    /// Convenience trigger addressing the single execution waiting at the
    /// named activity.
    pub fn trigger_activity(
        &mut self,
        activity_id: &str,
        vars: HashMap<String, Value>,
    ) -> Result<ExecutionId> {
        let waiting: Vec<ExecutionId> = self
            .waiting_executions()
            .into_iter()
            .filter(|(_, id)| id == activity_id)
            .map(|(e, _)| e)
            .collect();
        match waiting.as_slice() {
            [] => Err(EngineError::NoWaitingActivity(activity_id.to_string())),
            [single] => {
                let exec = *single;
                self.trigger(exec, vars)?;
                Ok(exec)
            }
            many => Err(EngineError::AmbiguousTrigger {
                activity: activity_id.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Fires a registered boundary timer by id.
    pub fn fire_timer(&mut self, timer_id: &str) -> Result<()> {
        self.ensure_active()?;
        let sub = self
            .subscriptions
            .iter()
            .find(|s| s.timer == timer_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTimer(timer_id.to_string()))?;
        subprocess::fire_timer(self, sub)?;
        self.run()
    }

    /// Starts a fresh execution at every event-scope anchor found beneath
    /// `exec`, re-running the preserved scopes. Returns the number of
    /// anchors triggered.
    pub fn compensate(&mut self, exec: ExecutionId) -> Result<usize> {
        self.ensure_active()?;
        self.tree.get(exec).ok_or(EngineError::UnknownExecution(exec))?;
        let anchors: Vec<ExecutionId> = self
            .tree
            .descendants(exec)
            .into_iter()
            .filter(|&d| self.tree.get(d).is_some_and(|n| n.is_event_scope))
            .collect();
        for &anchor in &anchors {
            let Some(activity) = self.tree.get(anchor).and_then(|n| n.activity) else {
                continue;
            };
            let child = self.tree.create_child(anchor);
            self.tree.set_activity(child, activity);
            self.events.push(EngineEvent::ExecutionCreated {
                execution: child,
                parent: Some(anchor),
            });
            self.events.push(EngineEvent::CompensationTriggered {
                anchor,
                activity: self.definition.activity_id(activity).to_string(),
            });
            self.queue.push_back(child);
        }
        self.run()?;
        Ok(anchors.len())
    }

    // ------------------------------------------------------------------
    // Graph walk
    // ------------------------------------------------------------------

    pub(crate) fn run(&mut self) -> Result<()> {
        let mut steps = 0;
        while let Some(exec) = self.queue.pop_front() {
            if self.state == InstanceState::Completed {
                break;
            }
            steps += 1;
            if steps > MAX_STEPS {
                return Err(EngineError::StepLimitExceeded(MAX_STEPS));
            }
            // The queued execution may have been cancelled or consumed by
            // work scheduled ahead of it.
            if self
                .tree
                .get(exec)
                .is_none_or(|n| !n.is_active || n.is_event_scope)
            {
                continue;
            }
            self.dispatch(exec)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, exec: ExecutionId) -> Result<()> {
        let def = self.definition.clone();
        let node = self.tree.get(exec).ok_or(EngineError::UnknownExecution(exec))?;
        let Some(act_idx) = node.activity else {
            return Err(EngineError::UnknownExecution(exec));
        };
        let activity = def.activity(act_idx);
        debug!(
            instance_id = %self.id,
            execution = %exec,
            activity = %activity.id,
            kind = activity.behavior.kind_name(),
            "dispatching activity"
        );
        self.events.push(EngineEvent::ActivityStarted {
            execution: exec,
            activity: activity.id.clone(),
        });

        match &activity.behavior {
            ActivityBehavior::Task { assignments } => {
                for (name, value) in assignments {
                    self.write_variable(exec, name, value.clone());
                }
                self.leave(exec)
            }
            ActivityBehavior::Wait => Ok(()),
            ActivityBehavior::End => self.end_execution(exec),
            ActivityBehavior::Exclusive => gateway::exclusive_take(self, exec),
            ActivityBehavior::Parallel => gateway::parallel_arrive(self, exec),
            ActivityBehavior::EmbeddedSubprocess | ActivityBehavior::EventScopeSubprocess => {
                subprocess::execute_composite(self, exec)
            }
        }
    }

    /// Leaves the current activity: takes all outgoing transitions, or ends
    /// the execution when there are none.
    pub(crate) fn leave(&mut self, exec: ExecutionId) -> Result<()> {
        let def = self.definition.clone();
        let node = self.tree.get(exec).ok_or(EngineError::UnknownExecution(exec))?;
        let Some(act_idx) = node.activity else {
            return Err(EngineError::UnknownExecution(exec));
        };
        let targets = def.activity(act_idx).outgoing_targets();
        if targets.is_empty() {
            self.end_execution(exec)
        } else {
            self.take_all(exec, targets, vec![exec])
        }
    }

    /// The transition-taker: distributes `targets` over reused recyclable
    /// executions and freshly created children of the concurrent root.
    /// Surplus recyclable executions are consumed.
    pub(crate) fn take_all(
        &mut self,
        exec: ExecutionId,
        targets: Vec<ActivityIdx>,
        mut recyclable: Vec<ExecutionId>,
    ) -> Result<()> {
        if targets.is_empty() {
            return Err(EngineError::InvalidModel(format!(
                "take_all on {exec} with no outgoing transitions"
            )));
        }
        let node = self.tree.get(exec).ok_or(EngineError::UnknownExecution(exec))?;
        let concurrent_root = if node.is_concurrent {
            node.parent.ok_or(EngineError::UnknownExecution(exec))?
        } else {
            exec
        };

        // An active composite execution hosting its children must keep
        // hosting: joins and forks among the children never absorb it or
        // park it, otherwise scope completion would not fire.
        let scope_hosting = concurrent_root != exec
            && self.tree.get(concurrent_root).is_some_and(|n| {
                n.is_active
                    && n.activity
                        .is_some_and(|a| self.definition.activity(a).behavior.is_composite())
            });

        // Concurrent siblings outside the recyclable set block a collapse,
        // parked ones included: an arrival folded into the root would be
        // invisible to a join's sibling scan and deadlock the gateway.
        let other_branches = self.tree.children(concurrent_root).into_iter().any(|c| {
            !recyclable.contains(&c)
                && self
                    .tree
                    .get(c)
                    .is_some_and(|n| n.is_concurrent && !n.is_event_scope)
        });

        if targets.len() == 1 && !other_branches {
            // The level of concurrency collapses into a single surviving
            // token; everything else recyclable is consumed.
            let survivor = if scope_hosting { exec } else { concurrent_root };
            for r in recyclable {
                if r != survivor {
                    self.consume(r);
                }
            }
            self.tree.set_active(survivor, true);
            self.take(survivor, targets[0]);
        } else {
            recyclable.retain(|&r| r != concurrent_root);
            let mut pool: VecDeque<ExecutionId> = recyclable.into();
            for target in targets {
                let outgoing = match pool.pop_front() {
                    Some(reused) => {
                        self.tree.set_active(reused, true);
                        self.tree.set_concurrent(reused, true);
                        reused
                    }
                    None => {
                        let child = self.tree.create_child(concurrent_root);
                        self.tree.set_concurrent(child, true);
                        self.events.push(EngineEvent::ExecutionCreated {
                            execution: child,
                            parent: Some(concurrent_root),
                        });
                        child
                    }
                };
                self.take(outgoing, target);
            }
            for leftover in pool {
                self.consume(leftover);
            }
            if !scope_hosting {
                // The root parks as the structural anchor of its branches.
                self.tree.set_active(concurrent_root, false);
            }
        }
        Ok(())
    }

    /// Positions an execution on the transition's target and schedules it.
    pub(crate) fn take(&mut self, exec: ExecutionId, target: ActivityIdx) {
        let to = self.definition.activity_id(target).to_string();
        self.tree.set_activity(exec, target);
        self.events.push(EngineEvent::TransitionTaken { execution: exec, to });
        self.queue.push_back(exec);
    }

    /// Removes an execution consumed by a join or superseded by reuse. No
    /// completion propagation: consumption is not completion.
    pub(crate) fn consume(&mut self, exec: ExecutionId) {
        self.cancel_subscriptions_for(exec);
        self.tree.remove(exec);
        self.events.push(EngineEvent::ExecutionEnded { execution: exec });
    }

    /// Ends an execution: children die first (their lifetime is bounded by
    /// the parent's), then completion propagates upward.
    pub(crate) fn end_execution(&mut self, exec: ExecutionId) -> Result<()> {
        let node = self.tree.get(exec).ok_or(EngineError::UnknownExecution(exec))?;
        let parent = node.parent;
        if parent.is_none() {
            self.final_variables = node.variables.clone();
        }
        for child in self.tree.children(exec) {
            self.destroy_subtree(child);
        }
        self.cancel_subscriptions_for(exec);
        self.tree.remove(exec);
        self.events.push(EngineEvent::ExecutionEnded { execution: exec });
        match parent {
            None => {
                self.state = InstanceState::Completed;
                self.queue.clear();
                self.events.push(EngineEvent::InstanceEnded);
                info!(instance_id = %self.id, "process instance completed");
                Ok(())
            }
            Some(parent) => self.completion_check(parent),
        }
    }

    /// Recursively removes a subtree without completion propagation. Used
    /// for parent-bounded teardown and interrupting-timer cancellation.
    pub(crate) fn destroy_subtree(&mut self, exec: ExecutionId) {
        for child in self.tree.children(exec) {
            self.destroy_subtree(child);
        }
        self.cancel_subscriptions_for(exec);
        self.tree.remove(exec);
        self.events.push(EngineEvent::ExecutionEnded { execution: exec });
    }

    /// Called after a child of `parent` was removed. Fires the composite
    /// last-execution-ended hook, or collapses a drained concurrent root.
    fn completion_check(&mut self, parent: ExecutionId) -> Result<()> {
        if !self.tree.live_children(parent).is_empty() {
            return Ok(());
        }
        let Some(node) = self.tree.get(parent) else {
            return Ok(());
        };
        if node.is_event_scope {
            // Dormant anchors host compensation re-runs; a re-run ending
            // leaves the anchor itself untouched.
            return Ok(());
        }
        let is_active = node.is_active;
        let composite = node
            .activity
            .is_some_and(|a| self.definition.activity(a).behavior.is_composite());
        if composite && is_active {
            subprocess::last_execution_ended(self, parent)
        } else if !is_active {
            // A parked structural root whose branches all ended without a
            // join has nothing left to wait for.
            self.end_execution(parent)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Variables and timers
    // ------------------------------------------------------------------

    pub(crate) fn write_variable(&mut self, exec: ExecutionId, name: &str, value: Value) {
        self.events.push(EngineEvent::VariableSet {
            execution: exec,
            name: name.to_string(),
            value: value.clone(),
        });
        self.tree.set_variable(exec, name, value);
    }

    pub(crate) fn subscribe_timer(
        &mut self,
        execution: ExecutionId,
        timer: &str,
        duration_ms: u64,
        interrupting: bool,
    ) {
        let due_at_ms = now_ms() + duration_ms;
        self.events.push(EngineEvent::TimerScheduled {
            execution,
            timer: timer.to_string(),
            due_at_ms,
        });
        self.subscriptions.push(TimerSubscription {
            execution,
            timer: timer.to_string(),
            due_at_ms,
            interrupting,
        });
    }

    pub(crate) fn cancel_subscriptions_for(&mut self, exec: ExecutionId) {
        let cancelled: Vec<TimerSubscription> = self
            .subscriptions
            .iter()
            .filter(|s| s.execution == exec)
            .cloned()
            .collect();
        self.subscriptions.retain(|s| s.execution != exec);
        for sub in cancelled {
            self.events.push(EngineEvent::TimerCancelled {
                execution: sub.execution,
                timer: sub.timer,
            });
        }
    }

    pub(crate) fn remove_subscription(&mut self, exec: ExecutionId, timer: &str) {
        self.subscriptions
            .retain(|s| !(s.execution == exec && s.timer == timer));
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == InstanceState::Completed {
            return Err(EngineError::InstanceEnded);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == InstanceState::Completed
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    pub fn root(&self) -> ExecutionId {
        self.root
    }

    pub fn execution(&self, id: ExecutionId) -> Option<&ExecutionNode> {
        self.tree.get(id)
    }

    pub fn live_execution_count(&self) -> usize {
        self.tree.live_count()
    }

    /// Root-scope variable lookup; falls back to the completion snapshot
    /// once the instance has ended.
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.tree
            .variable(self.root, name)
            .cloned()
            .or_else(|| self.final_variables.get(name).cloned())
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.tree.set_variable_local(self.root, name, value);
    }

    /// Activity ids of all live active tokens.
    pub fn active_activities(&self) -> Vec<String> {
        self.tree
            .live_ids()
            .into_iter()
            .filter_map(|id| self.tree.get(id))
            .filter(|n| n.is_active && !n.is_event_scope)
            .filter_map(|n| n.activity)
            .map(|a| self.definition.activity_id(a).to_string())
            .collect()
    }

    /// Executions parked at wait states, with their activity ids.
    pub fn waiting_executions(&self) -> Vec<(ExecutionId, String)> {
        self.tree
            .live_ids()
            .into_iter()
            .filter_map(|id| self.tree.get(id).map(|n| (id, n)))
            .filter(|(_, n)| n.is_active && !n.is_event_scope)
            .filter_map(|(id, n)| n.activity.map(|a| (id, a)))
            .filter(|(_, a)| self.definition.activity(*a).behavior.is_wait_state())
            .map(|(id, a)| (id, self.definition.activity_id(a).to_string()))
            .collect()
    }

    /// All executions currently positioned at the named activity, live or
    /// parked.
    pub fn executions_at(&self, activity_id: &str) -> Vec<ExecutionId> {
        let Some(idx) = self.definition.find_activity(activity_id) else {
            return Vec::new();
        };
        self.tree
            .live_ids()
            .into_iter()
            .filter(|&id| self.tree.get(id).is_some_and(|n| n.activity == Some(idx)))
            .collect()
    }

    /// Dormant event-scope anchors, in handle order.
    pub fn event_scope_executions(&self) -> Vec<ExecutionId> {
        self.tree
            .live_ids()
            .into_iter()
            .filter(|&id| self.tree.get(id).is_some_and(|n| n.is_event_scope))
            .collect()
    }

    pub fn timer_subscriptions(&self) -> &[TimerSubscription] {
        &self.subscriptions
    }

    pub fn due_timer_ids(&self, now_ms: u64) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|s| s.due_at_ms <= now_ms)
            .map(|s| s.timer.clone())
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
