//! Market-insight orchestration kernel.
//!
//! A graph-structured execution engine that fans four analyst agents out
//! against a chat model, routes them through optional peer-review and
//! red-team debate rounds, synthesizes a final report, and streams every
//! lifecycle transition over SSE while persisting it first.
//!
//! Layering, leaves first:
//! - [`llm`]: the streaming chat-model adapter
//! - [`tools`]: tool mediation (registry, guardrail, cache, estimates)
//! - [`events`]: the typed event taxonomy and in-process bus
//! - [`store`]: records, Postgres/in-memory stores, the event sink
//! - [`agents`] / [`debate`] / [`policy`]: stage execution and critique
//! - [`engine`]: the pipeline itself
//! - [`server`]: the HTTP/SSE front

#![allow(clippy::uninlined_format_args)]

pub mod agents;
pub mod config;
pub mod debate;
pub mod engine;
pub mod events;
pub mod evidence;
pub mod llm;
pub mod memory;
pub mod policy;
pub mod server;
pub mod store;
pub mod tools;

// Re-export the types a binary or test needs to drive a run end-to-end.
pub use agents::{AgentContext, AgentName, Profile, WORKER_AGENTS};
pub use config::AppConfig;
pub use engine::{
    cancel_channel, CancelHandle, CancelToken, EventPipe, GraphEngine, RunConfig, TerminalStatus,
};
pub use events::{AgentStatus, DebateType, EventBus, SharedEventBus, WorkflowEvent};
pub use llm::{ArkClient, ChatModel, ChatRequest, ChunkStream, LlmError, StreamChunk};
pub use policy::{DegradeMode, RetryPolicy};
pub use store::{
    AgentResultRecord, DebateExchangeRecord, MemoryStore, PgStore, SessionEventSink,
    SessionRecord, SessionStatus, SharedStore, Store, StoreError, ToolInvocationRecord,
    WorkflowEventRecord, WorkflowPhase,
};
pub use tools::{ToolGuardrail, ToolRegistry};
