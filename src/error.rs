use crate::runtime::tree::ExecutionId;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine. Model-validation problems abort the
/// current command synchronously; there is no retry at this level.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid process model: {0}")]
    InvalidModel(String),

    #[error("unknown process definition '{0}'")]
    UnknownDefinition(String),

    #[error("unknown process instance {0}")]
    UnknownInstance(Uuid),

    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("execution {0} is not parked at a wait state")]
    NotWaiting(ExecutionId),

    #[error("no waiting execution at activity '{0}'")]
    NoWaitingActivity(String),

    #[error("ambiguous trigger: {count} executions waiting at '{activity}'")]
    AmbiguousTrigger { activity: String, count: usize },

    #[error("no timer subscription '{0}'")]
    UnknownTimer(String),

    #[error("process instance has already ended")]
    InstanceEnded,

    #[error("step limit of {0} exceeded; the model likely cycles without a wait state")]
    StepLimitExceeded(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse process definition: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
