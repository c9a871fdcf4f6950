use crate::runtime::tree::ExecutionId;
use serde::Serialize;
use serde_json::Value;

/// Structured audit events accumulated per process instance. The engine
/// drains them after each command and hands them to registered listeners.
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    InstanceStarted {
        definition: String,
    },
    InstanceEnded,
    ActivityStarted {
        execution: ExecutionId,
        activity: String,
    },
    TransitionTaken {
        execution: ExecutionId,
        to: String,
    },
    ExecutionCreated {
        execution: ExecutionId,
        parent: Option<ExecutionId>,
    },
    ExecutionEnded {
        execution: ExecutionId,
    },
    JoinArrived {
        execution: ExecutionId,
        gateway: String,
        joined: usize,
        required: usize,
    },
    JoinFired {
        gateway: String,
        consumed: usize,
    },
    EventScopeCreated {
        marker: ExecutionId,
        activity: String,
    },
    CompensationTriggered {
        anchor: ExecutionId,
        activity: String,
    },
    TimerScheduled {
        execution: ExecutionId,
        timer: String,
        due_at_ms: u64,
    },
    TimerFired {
        execution: ExecutionId,
        timer: String,
    },
    TimerCancelled {
        execution: ExecutionId,
        timer: String,
    },
    SubtreeCancelled {
        scope: ExecutionId,
        removed: usize,
    },
    VariableSet {
        execution: ExecutionId,
        name: String,
        value: Value,
    },
    TriggerReceived {
        execution: ExecutionId,
    },
}
