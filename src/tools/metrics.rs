//! Token and cost estimation for tool invocations.
//!
//! These are heuristics, not billing data; everything downstream reports
//! them under `cost_mode = "estimate"`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PricingConfig;
use crate::store::ToolInvocationRecord;

pub const COST_MODE_ESTIMATE: &str = "estimate";

/// Estimated size and cost of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InvocationEstimate {
    pub estimated_input_tokens: u64,
    pub estimated_output_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// Rough token count: ~1.3 tokens per word plus a small charge for
/// punctuation. Good enough for budget guardrails.
pub fn estimate_tokens(payload: &Value) -> u64 {
    let text = payload_text(payload);
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count() as f64;
    let punct = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count() as f64;
    let estimate = words * 1.3 + punct * 0.3;
    (estimate.round() as u64).max(1)
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Estimate tokens and cost for one input/output payload pair.
pub fn estimate_invocation(
    pricing: &PricingConfig,
    input: &Value,
    output: &Value,
) -> InvocationEstimate {
    let estimated_input_tokens = estimate_tokens(input);
    let estimated_output_tokens = estimate_tokens(output);
    let cost = (estimated_input_tokens as f64 / 1000.0) * pricing.input_usd_per_1k
        + (estimated_output_tokens as f64 / 1000.0) * pricing.output_usd_per_1k;

    InvocationEstimate {
        estimated_input_tokens,
        estimated_output_tokens,
        estimated_cost_usd: round6(cost),
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Aggregated counters for a set of invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetrics {
    pub total_calls: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_duration_ms: f64,
    pub total_estimated_cost_usd: f64,
    pub cache_hit_count: u64,
    pub cache_hit_rate: f64,
    pub cost_mode: String,
}

/// Session-level and per-agent aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedToolMetrics {
    pub session: ToolMetrics,
    pub by_agent: BTreeMap<String, ToolMetrics>,
}

fn calc(rows: &[&ToolInvocationRecord]) -> ToolMetrics {
    let total_calls = rows.len() as u64;
    let error_count = rows
        .iter()
        .filter(|r| matches!(r.status.as_str(), "error" | "failed"))
        .count() as u64;
    let total_duration: u64 = rows.iter().filter_map(|r| r.duration_ms).sum();
    let total_cost: f64 = rows.iter().filter_map(|r| r.estimated_cost_usd).sum();
    let cache_hit_count = rows.iter().filter(|r| r.cache_hit).count() as u64;

    let denom = total_calls.max(1) as f64;
    ToolMetrics {
        total_calls,
        error_count,
        error_rate: if total_calls == 0 {
            0.0
        } else {
            round4(error_count as f64 / denom)
        },
        avg_duration_ms: if total_calls == 0 {
            0.0
        } else {
            (total_duration as f64 / denom * 100.0).round() / 100.0
        },
        total_estimated_cost_usd: round6(total_cost),
        cache_hit_count,
        cache_hit_rate: if total_calls == 0 {
            0.0
        } else {
            round4(cache_hit_count as f64 / denom)
        },
        cost_mode: COST_MODE_ESTIMATE.to_string(),
    }
}

/// Aggregate stored invocation rows into session and per-agent metrics.
pub fn aggregate_tool_metrics(invocations: &[ToolInvocationRecord]) -> AggregatedToolMetrics {
    let all: Vec<&ToolInvocationRecord> = invocations.iter().collect();

    let mut by_agent_rows: BTreeMap<String, Vec<&ToolInvocationRecord>> = BTreeMap::new();
    for row in invocations {
        let agent = row
            .agent_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        by_agent_rows.entry(agent).or_default().push(row);
    }

    AggregatedToolMetrics {
        session: calc(&all),
        by_agent: by_agent_rows
            .into_iter()
            .map(|(agent, rows)| (agent, calc(&rows)))
            .collect(),
    }
}
