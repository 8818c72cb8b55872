//! Evidence pack construction.
//!
//! After synthesis, claim-like sentences are pulled out of the final report
//! and mapped back to the agents whose analyses support them via lexical
//! overlap. Sources come from agent-collected URLs and URL-like tokens in
//! tool outputs. Best effort by contract: this never fails the session.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::agents::Profile;
use crate::store::{AgentResultRecord, ToolInvocationRecord};

const MAX_CLAIMS: usize = 12;
const MIN_CLAIM_WORDS: usize = 6;
/// Fraction of a claim's tokens an agent's content must cover to count as
/// a supporting agent.
const MIN_OVERLAP: f64 = 0.3;

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https?://[^\s)\]}>\x22']+")
            .expect("static regex compiles")
    })
}

/// Build the evidence pack as a JSON document stored on the session row.
pub fn build_evidence_pack(
    session_id: &str,
    profile: &Profile,
    agent_results: &[AgentResultRecord],
    tool_invocations: &[ToolInvocationRecord],
    final_report: &str,
    generated_at: &str,
) -> Value {
    let claims = extract_claims(final_report);
    let (sources, source_ids) = build_source_index(agent_results, tool_invocations);

    let mut claim_entries = Vec::new();
    let mut traceability = Vec::new();

    for (idx, claim) in claims.iter().enumerate() {
        let claim_id = format!("C{:03}", idx + 1);
        let supporting = supporting_agents(claim, agent_results);

        let supporting_sources: Vec<String> = supporting
            .iter()
            .flat_map(|agent| {
                agent_results
                    .iter()
                    .filter(move |r| &r.agent_name == agent)
                    .flat_map(|r| r.sources.iter())
            })
            .filter_map(|source| source_ids.get(source).cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let tool_invocation_ids: Vec<String> = tool_invocations
            .iter()
            .filter(|inv| {
                inv.agent_name
                    .as_deref()
                    .map(|a| supporting.iter().any(|s| s == a))
                    .unwrap_or(false)
            })
            .map(|inv| inv.invocation_id.clone())
            .collect();

        claim_entries.push(json!({
            "id": claim_id,
            "text": claim,
            "source_agents": supporting,
            "supporting_sources": supporting_sources,
        }));
        traceability.push(json!({
            "claim_id": claim_id,
            "source_agents": supporting,
            "tool_invocation_ids": tool_invocation_ids,
        }));
    }

    json!({
        "version": "evidence.v1",
        "session_id": session_id,
        "generated_at": generated_at,
        "profile": {
            "target_market": profile.target_market,
            "supply_chain": profile.supply_chain,
            "seller_type": profile.seller_type,
            "min_price": profile.min_price,
            "max_price": profile.max_price,
        },
        "report_excerpt": clip(final_report, 300),
        "claims": claim_entries,
        "sources": sources,
        "traceability": traceability,
        "stats": {
            "claims_count": claims.len(),
            "sources_count": sources.len(),
        },
    })
}

/// Claim-like sentences: long enough to assert something, not headings or
/// list scaffolding.
fn extract_claims(report: &str) -> Vec<String> {
    let mut claims = Vec::new();
    for raw in report.split(['\n', '。']) {
        for sentence in raw.split(". ") {
            let sentence = sentence
                .trim()
                .trim_start_matches(['#', '-', '*', '>'])
                .trim();
            if sentence.is_empty() || sentence.starts_with('|') {
                continue;
            }
            if sentence.split_whitespace().count() < MIN_CLAIM_WORDS {
                continue;
            }
            claims.push(clip(sentence, 280));
            if claims.len() >= MAX_CLAIMS {
                return claims;
            }
        }
    }
    claims
}

/// Agents whose content lexically covers the claim.
fn supporting_agents(claim: &str, agent_results: &[AgentResultRecord]) -> Vec<String> {
    let claim_tokens = tokens(claim);
    if claim_tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(String, f64)> = agent_results
        .iter()
        .filter(|r| !r.content.is_empty())
        .map(|r| {
            let content_tokens = tokens(&r.content);
            let overlap = claim_tokens
                .iter()
                .filter(|t| content_tokens.contains(*t))
                .count() as f64
                / claim_tokens.len() as f64;
            (r.agent_name.clone(), overlap)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let above: Vec<String> = scored
        .iter()
        .filter(|(_, score)| *score >= MIN_OVERLAP)
        .map(|(agent, _)| agent.clone())
        .collect();
    if !above.is_empty() {
        return above;
    }
    // Fall back to the single best match so every claim stays traceable.
    scored
        .into_iter()
        .take(1)
        .filter(|(_, score)| *score > 0.0)
        .map(|(agent, _)| agent)
        .collect()
}

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(String::from)
        .collect()
}

/// Global source index: agent-collected URLs first, then URL-like tokens
/// found in tool outputs.
fn build_source_index(
    agent_results: &[AgentResultRecord],
    tool_invocations: &[ToolInvocationRecord],
) -> (Vec<Value>, BTreeMap<String, String>) {
    let mut sources = Vec::new();
    let mut ids = BTreeMap::new();

    let mut add = |reference: &str, kind: &str| {
        if ids.contains_key(reference) {
            return;
        }
        let id = format!("S{:03}", sources.len() + 1);
        ids.insert(reference.to_string(), id.clone());
        sources.push(json!({"id": id, "type": kind, "ref": reference}));
    };

    for result in agent_results {
        for source in &result.sources {
            let kind = if source.starts_with("http") {
                "url"
            } else {
                "reference"
            };
            add(source, kind);
        }
    }

    for invocation in tool_invocations {
        if let Some(output) = &invocation.output {
            let text = output.to_string();
            for m in url_regex().find_iter(&text) {
                add(m.as_str(), "url");
            }
        }
    }

    (sources, ids)
}

fn clip(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let clipped: String = trimmed.chars().take(limit.saturating_sub(1)).collect();
    format!("{}…", clipped)
}
