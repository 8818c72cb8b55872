//! Session-level tool guardrail.
//!
//! Tracks cost and error-rate counters per session; once a threshold trips,
//! web search is disabled for the remainder of that session and exactly one
//! `guardrail_triggered` event is emitted.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::GuardrailConfig;

/// Running counters for one session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GuardrailStats {
    pub total_calls: u64,
    pub error_calls: u64,
    pub estimated_cost_usd: f64,
}

impl GuardrailStats {
    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.error_calls as f64 / self.total_calls as f64
        }
    }
}

/// Outcome of a guardrail evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailVerdict {
    Ok,
    Triggered { rule: String, details: Value },
}

/// Cost and error-rate circuit breaker for tool usage.
pub struct ToolGuardrail {
    config: GuardrailConfig,
    state: Mutex<GuardrailState>,
}

#[derive(Default)]
struct GuardrailState {
    stats: HashMap<String, GuardrailStats>,
    disabled_sessions: HashSet<String>,
    announced_sessions: HashSet<String>,
}

impl ToolGuardrail {
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GuardrailState::default()),
        }
    }

    /// Record one finished invocation.
    pub async fn record_invocation(&self, session_id: &str, is_error: bool, cost_usd: f64) {
        let mut state = self.state.lock().await;
        let stats = state.stats.entry(session_id.to_string()).or_default();
        stats.total_calls += 1;
        if is_error {
            stats.error_calls += 1;
        }
        stats.estimated_cost_usd += cost_usd.max(0.0);
    }

    /// Whether web search has been cut off for this session.
    pub async fn is_websearch_disabled(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .await
            .disabled_sessions
            .contains(session_id)
    }

    pub async fn stats(&self, session_id: &str) -> GuardrailStats {
        self.state
            .lock()
            .await
            .stats
            .get(session_id)
            .copied()
            .unwrap_or_default()
    }

    /// Evaluate thresholds. A trip disables web search for the session;
    /// the verdict carries details only the first time so the event fires
    /// exactly once.
    pub async fn evaluate(&self, session_id: &str) -> GuardrailVerdict {
        let mut state = self.state.lock().await;
        let stats = state.stats.get(session_id).copied().unwrap_or_default();

        let cost_hit = stats.estimated_cost_usd > self.config.max_estimated_cost_usd;
        let error_rate_hit = stats.total_calls >= self.config.min_calls_for_error_rate
            && stats.error_rate() > self.config.max_error_rate;

        if !(cost_hit || error_rate_hit) {
            return GuardrailVerdict::Ok;
        }

        state.disabled_sessions.insert(session_id.to_string());
        if !state.announced_sessions.insert(session_id.to_string()) {
            // Already announced; stay silent but keep the tool disabled.
            return GuardrailVerdict::Ok;
        }

        let rule = if cost_hit {
            "estimated_cost_exceeded"
        } else {
            "error_rate_exceeded"
        };
        GuardrailVerdict::Triggered {
            rule: rule.to_string(),
            details: json!({
                "total_calls": stats.total_calls,
                "error_rate": (stats.error_rate() * 10_000.0).round() / 10_000.0,
                "estimated_cost_usd": (stats.estimated_cost_usd * 1_000_000.0).round() / 1_000_000.0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail(max_cost: f64, max_error_rate: f64, min_calls: u64) -> ToolGuardrail {
        ToolGuardrail::new(GuardrailConfig {
            max_estimated_cost_usd: max_cost,
            max_error_rate,
            min_calls_for_error_rate: min_calls,
        })
    }

    #[tokio::test]
    async fn test_under_thresholds_is_ok() {
        let g = guardrail(1.0, 0.5, 3);
        g.record_invocation("s", false, 0.01).await;
        assert_eq!(g.evaluate("s").await, GuardrailVerdict::Ok);
        assert!(!g.is_websearch_disabled("s").await);
    }

    #[tokio::test]
    async fn test_cost_threshold_trips() {
        let g = guardrail(0.05, 0.5, 3);
        g.record_invocation("s", false, 0.10).await;
        match g.evaluate("s").await {
            GuardrailVerdict::Triggered { rule, .. } => {
                assert_eq!(rule, "estimated_cost_exceeded")
            }
            GuardrailVerdict::Ok => panic!("expected trip"),
        }
        assert!(g.is_websearch_disabled("s").await);
    }

    #[tokio::test]
    async fn test_error_rate_needs_minimum_calls() {
        let g = guardrail(10.0, 0.5, 3);
        g.record_invocation("s", true, 0.0).await;
        g.record_invocation("s", true, 0.0).await;
        // Two calls at 100% error rate, but the floor is three.
        assert_eq!(g.evaluate("s").await, GuardrailVerdict::Ok);

        g.record_invocation("s", true, 0.0).await;
        assert!(matches!(
            g.evaluate("s").await,
            GuardrailVerdict::Triggered { rule, .. } if rule == "error_rate_exceeded"
        ));
    }

    #[tokio::test]
    async fn test_announced_only_once() {
        let g = guardrail(0.01, 0.5, 3);
        g.record_invocation("s", false, 1.0).await;
        assert!(matches!(
            g.evaluate("s").await,
            GuardrailVerdict::Triggered { .. }
        ));
        // Second evaluation stays quiet but keeps the tool disabled.
        assert_eq!(g.evaluate("s").await, GuardrailVerdict::Ok);
        assert!(g.is_websearch_disabled("s").await);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let g = guardrail(0.01, 0.5, 3);
        g.record_invocation("a", false, 1.0).await;
        let _ = g.evaluate("a").await;
        assert!(g.is_websearch_disabled("a").await);
        assert!(!g.is_websearch_disabled("b").await);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let g = guardrail(1.0, 0.5, 3);
        g.record_invocation("s", false, 0.01).await;
        g.record_invocation("s", true, 0.02).await;
        let stats = g.stats("s").await;
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.error_calls, 1);
        assert!((stats.estimated_cost_usd - 0.03).abs() < 1e-9);
        assert!((stats.error_rate() - 0.5).abs() < 1e-9);
    }
}
