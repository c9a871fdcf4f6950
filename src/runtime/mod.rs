pub mod engine;
pub mod events;
pub mod instance;
pub mod registry;
pub mod tree;

pub use engine::{ProcessEngine, ProcessEventListener};
pub use events::EngineEvent;
pub use instance::{InstanceState, ProcessInstance, TimerSubscription};
pub use registry::EngineRegistry;
pub use tree::{ExecutionId, ExecutionNode, ExecutionTree};
