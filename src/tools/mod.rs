//! Tool mediation: registry, guardrail, cache, cost estimation, redaction.

pub mod cache;
pub mod guardrail;
pub mod metrics;
pub mod redact;
pub mod registry;

pub use cache::ToolCache;
pub use guardrail::{GuardrailStats, GuardrailVerdict, ToolGuardrail};
pub use metrics::{aggregate_tool_metrics, AggregatedToolMetrics, ToolMetrics};
pub use redact::redact_payload;
pub use registry::{ToolInvokeResult, ToolRegistry};
