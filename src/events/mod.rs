//! Workflow event types and the in-process bus that carries them.

pub mod bus;
pub mod types;

pub use bus::{EventBus, SharedEventBus};
pub use types::{AgentStatus, DebateType, WorkflowEvent};
