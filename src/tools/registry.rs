//! Tool registry.
//!
//! Single mediation point for external tool calls within one session. The
//! registry owns the invocation lifecycle (ids, timing, estimates), the
//! result cache, and the guardrail. It does not publish events itself; it
//! returns them so the caller can route every one through the persistence
//! sink before the bus, preserving durability-before-emit.

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{GuardrailConfig, PricingConfig};
use crate::events::WorkflowEvent;
use crate::tools::cache::ToolCache;
use crate::tools::guardrail::{GuardrailVerdict, ToolGuardrail};
use crate::tools::metrics::{estimate_invocation, COST_MODE_ESTIMATE};
use crate::tools::redact::redact_payload;

struct InvocationState {
    tool_name: String,
    agent_name: String,
    context: Option<String>,
    model_name: String,
    cache_hit: bool,
    input: Value,
    started: Instant,
}

/// Result of a mediated [`ToolRegistry::invoke`] call.
#[derive(Debug)]
pub struct ToolInvokeResult {
    pub invocation_id: String,
    pub output: Value,
    pub cache_hit: bool,
    /// True when the guardrail short-circuited the call; `output` then
    /// carries a `guardrail_triggered` marker instead of tool output.
    pub short_circuited: bool,
    pub is_error: bool,
    /// Events to pipe through sink + bus, in order.
    pub events: Vec<WorkflowEvent>,
}

/// Per-session tool mediator.
pub struct ToolRegistry {
    session_id: String,
    pricing: PricingConfig,
    guardrail: ToolGuardrail,
    cache: ToolCache,
    active: Mutex<HashMap<String, InvocationState>>,
}

impl ToolRegistry {
    pub fn new(session_id: &str, guardrail: GuardrailConfig, pricing: PricingConfig) -> Self {
        Self {
            session_id: session_id.to_string(),
            pricing,
            guardrail: ToolGuardrail::new(guardrail),
            cache: ToolCache::default(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Gate for provider-side web search: the request flag AND an
    /// untripped guardrail.
    pub async fn should_enable_websearch(&self, requested: bool) -> bool {
        requested && !self.guardrail.is_websearch_disabled(&self.session_id).await
    }

    /// Start an invocation; returns its id and the `tool_start` event.
    pub async fn begin_invocation(
        &self,
        tool_name: &str,
        agent_name: &str,
        context: Option<&str>,
        model_name: &str,
        input: Value,
        cache_hit: bool,
    ) -> (String, WorkflowEvent) {
        let invocation_id = Uuid::new_v4().to_string();
        let redacted_input = redact_payload(&input);
        let now = Utc::now();

        let state = InvocationState {
            tool_name: tool_name.to_string(),
            agent_name: agent_name.to_string(),
            context: context.map(String::from),
            model_name: model_name.to_string(),
            cache_hit,
            input: redacted_input.clone(),
            started: Instant::now(),
        };
        self.active
            .lock()
            .await
            .insert(invocation_id.clone(), state);

        let event = WorkflowEvent::ToolStart {
            invocation_id: invocation_id.clone(),
            tool: tool_name.to_string(),
            agent: agent_name.to_string(),
            context: context.map(String::from),
            model_name: model_name.to_string(),
            cache_hit,
            input: redacted_input,
            timestamp: now,
        };
        (invocation_id, event)
    }

    /// Finish an invocation successfully. Returns `tool_end` and, when a
    /// threshold newly trips, a `guardrail_triggered` event.
    pub async fn end_invocation(&self, invocation_id: &str, output: Value) -> Vec<WorkflowEvent> {
        let state = self.take_state(invocation_id).await;
        let redacted_output = redact_payload(&output);
        let estimate = estimate_invocation(&self.pricing, &state.input, &redacted_output);
        let duration_ms = state.started.elapsed().as_millis() as u64;

        self.guardrail
            .record_invocation(&self.session_id, false, estimate.estimated_cost_usd)
            .await;

        let mut events = vec![WorkflowEvent::ToolEnd {
            invocation_id: invocation_id.to_string(),
            tool: state.tool_name.clone(),
            agent: state.agent_name.clone(),
            context: state.context.clone(),
            model_name: state.model_name.clone(),
            cache_hit: state.cache_hit,
            input: state.input.clone(),
            output: redacted_output,
            duration_ms,
            estimated_input_tokens: estimate.estimated_input_tokens,
            estimated_output_tokens: estimate.estimated_output_tokens,
            estimated_cost_usd: estimate.estimated_cost_usd,
            cost_mode: COST_MODE_ESTIMATE.to_string(),
            timestamp: Utc::now(),
        }];
        self.append_guardrail_event(&state.agent_name, &mut events)
            .await;
        events
    }

    /// Finish an invocation with an error. Tool errors are never fatal to
    /// the stage; the caller just continues without the tool result.
    pub async fn error_invocation(
        &self,
        invocation_id: &str,
        error_message: &str,
    ) -> Vec<WorkflowEvent> {
        let state = self.take_state(invocation_id).await;
        let duration_ms = state.started.elapsed().as_millis() as u64;

        self.guardrail
            .record_invocation(&self.session_id, true, 0.0)
            .await;

        let mut events = vec![WorkflowEvent::ToolError {
            invocation_id: invocation_id.to_string(),
            tool: state.tool_name.clone(),
            agent: state.agent_name.clone(),
            error: error_message.to_string(),
            duration_ms,
            timestamp: Utc::now(),
        }];
        self.append_guardrail_event(&state.agent_name, &mut events)
            .await;
        events
    }

    /// Full mediated call: guardrail short-circuit, cache consult, external
    /// call, lifecycle events. `call` performs the actual external work.
    pub async fn invoke<F, Fut>(
        &self,
        tool_name: &str,
        agent_name: &str,
        context: Option<&str>,
        model_name: &str,
        input: Value,
        call: F,
    ) -> ToolInvokeResult
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        // Guardrail short-circuit: no external call, no new counters.
        if self.guardrail.is_websearch_disabled(&self.session_id).await {
            return ToolInvokeResult {
                invocation_id: String::new(),
                output: json!({"guardrail_triggered": true}),
                cache_hit: false,
                short_circuited: true,
                is_error: false,
                events: Vec::new(),
            };
        }

        let cache_key = ToolCache::build_key(tool_name, &input, &self.session_id);
        let cached = self.cache.get(&cache_key).await;
        let cache_hit = cached.is_some();

        let (invocation_id, start_event) = self
            .begin_invocation(tool_name, agent_name, context, model_name, input.clone(), cache_hit)
            .await;
        let mut events = vec![start_event];

        let outcome = match cached {
            Some(value) => Ok(value),
            None => call(input).await,
        };

        match outcome {
            Ok(output) => {
                if !cache_hit {
                    self.cache.put(cache_key, output.clone()).await;
                }
                events.extend(self.end_invocation(&invocation_id, output.clone()).await);
                ToolInvokeResult {
                    invocation_id,
                    output,
                    cache_hit,
                    short_circuited: false,
                    is_error: false,
                    events,
                }
            }
            Err(message) => {
                events.extend(self.error_invocation(&invocation_id, &message).await);
                ToolInvokeResult {
                    invocation_id,
                    output: json!({"error": message}),
                    cache_hit: false,
                    short_circuited: false,
                    is_error: true,
                    events,
                }
            }
        }
    }

    async fn append_guardrail_event(&self, agent: &str, events: &mut Vec<WorkflowEvent>) {
        if let GuardrailVerdict::Triggered { rule, details } =
            self.guardrail.evaluate(&self.session_id).await
        {
            events.push(WorkflowEvent::GuardrailTriggered {
                session_id: self.session_id.clone(),
                agent: Some(agent.to_string()),
                rule,
                details,
                timestamp: Utc::now(),
            });
        }
    }

    async fn take_state(&self, invocation_id: &str) -> InvocationState {
        self.active
            .lock()
            .await
            .remove(invocation_id)
            .unwrap_or_else(|| InvocationState {
                tool_name: "web_search".to_string(),
                agent_name: "unknown".to_string(),
                context: None,
                model_name: "unknown".to_string(),
                cache_hit: false,
                input: Value::Null,
                started: Instant::now(),
            })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn registry(session: &str) -> ToolRegistry {
        let config = AppConfig::default();
        ToolRegistry::new(session, config.guardrail, config.pricing)
    }

    fn strict_registry(session: &str) -> ToolRegistry {
        ToolRegistry::new(
            session,
            GuardrailConfig {
                max_estimated_cost_usd: 0.0,
                max_error_rate: 0.5,
                min_calls_for_error_rate: 3,
            },
            PricingConfig {
                input_usd_per_1k: 1.0,
                output_usd_per_1k: 1.0,
            },
        )
    }

    #[tokio::test]
    async fn test_begin_end_lifecycle_events() {
        let reg = registry("s-1");
        let (id, start) = reg
            .begin_invocation(
                "web_search",
                "trend_scout",
                Some("gather"),
                "model-a",
                json!({"q": "trends"}),
                false,
            )
            .await;
        assert_eq!(start.event_type(), "tool_start");

        let events = reg.end_invocation(&id, json!({"results": ["a"]})).await;
        assert_eq!(events[0].event_type(), "tool_end");
        if let WorkflowEvent::ToolEnd {
            invocation_id,
            estimated_cost_usd,
            cost_mode,
            ..
        } = &events[0]
        {
            assert_eq!(invocation_id, &id);
            assert!(*estimated_cost_usd >= 0.0);
            assert_eq!(cost_mode, "estimate");
        } else {
            panic!("expected tool_end");
        }
    }

    #[tokio::test]
    async fn test_error_lifecycle() {
        let reg = registry("s-1");
        let (id, _) = reg
            .begin_invocation("web_search", "trend_scout", None, "m", json!({}), false)
            .await;
        let events = reg.error_invocation(&id, "upstream 500").await;
        assert_eq!(events[0].event_type(), "tool_error");
    }

    #[tokio::test]
    async fn test_invoke_caches_second_call() {
        let reg = registry("s-1");
        let input = json!({"q": "same query"});

        let first = reg
            .invoke("web_search", "trend_scout", None, "m", input.clone(), |_| async {
                Ok(json!({"results": ["fresh"]}))
            })
            .await;
        assert!(!first.cache_hit);

        // A cache hit must not run the external call.
        let second = reg
            .invoke("web_search", "trend_scout", None, "m", input, |_| async {
                panic!("external tool must not be called on cache hit")
            })
            .await;
        assert!(second.cache_hit);
        assert_eq!(second.output, json!({"results": ["fresh"]}));
    }

    #[tokio::test]
    async fn test_invoke_error_is_not_cached() {
        let reg = registry("s-1");
        let input = json!({"q": "flaky"});
        let first = reg
            .invoke("web_search", "a", None, "m", input.clone(), |_| async {
                Err("boom".to_string())
            })
            .await;
        assert!(first.is_error);

        let second = reg
            .invoke("web_search", "a", None, "m", input, |_| async {
                Ok(json!({"ok": true}))
            })
            .await;
        assert!(!second.cache_hit);
        assert!(!second.is_error);
    }

    #[tokio::test]
    async fn test_guardrail_trip_then_short_circuit() {
        let reg = strict_registry("s-1");
        let first = reg
            .invoke("web_search", "a", None, "m", json!({"q": "expensive words here"}), |_| async {
                Ok(json!({"results": ["lots of output text to cost something"]}))
            })
            .await;
        assert!(!first.short_circuited);
        assert!(first
            .events
            .iter()
            .any(|e| e.event_type() == "guardrail_triggered"));

        let second = reg
            .invoke("web_search", "a", None, "m", json!({"q": "another"}), |_| async {
                panic!("guardrail must short-circuit the call")
            })
            .await;
        assert!(second.short_circuited);
        assert!(second.events.is_empty());
        assert_eq!(second.output["guardrail_triggered"], true);
    }

    #[tokio::test]
    async fn test_websearch_gate() {
        let reg = registry("s-1");
        assert!(reg.should_enable_websearch(true).await);
        assert!(!reg.should_enable_websearch(false).await);
    }

    #[tokio::test]
    async fn test_input_redacted_in_events() {
        let reg = registry("s-1");
        let (_, start) = reg
            .begin_invocation(
                "web_search",
                "a",
                None,
                "m",
                json!({"q": "x", "api_key": "sk-secret"}),
                false,
            )
            .await;
        if let WorkflowEvent::ToolStart { input, .. } = start {
            assert_eq!(input["api_key"], "[REDACTED]");
            assert_eq!(input["q"], "x");
        } else {
            panic!("expected tool_start");
        }
    }
}
