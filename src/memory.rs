//! Session memory snapshot.
//!
//! A session-local recap written next to the evidence pack: key entities,
//! one highlight block per agent, and action/risk items lifted from the
//! final report. Not cross-session memory; a fresh run starts empty.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::agents::Profile;
use crate::debate::ExchangeSummary;
use crate::store::AgentResultRecord;

const HIGHLIGHT_LIMIT: usize = 3;
const ACTION_ITEM_LIMIT: usize = 6;
const RISK_ITEM_LIMIT: usize = 4;

fn list_item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*+]|\d+\.)\s+(.+)$")
            .expect("static regex compiles")
    })
}

/// Build the memory snapshot stored on the session row.
pub fn build_memory_snapshot(
    session_id: &str,
    profile: &Profile,
    agent_results: &[AgentResultRecord],
    exchanges: &[ExchangeSummary],
    final_report: &str,
    generated_at: &str,
) -> Value {
    let mut agent_highlights = Map::new();
    for result in agent_results {
        agent_highlights.insert(
            result.agent_name.clone(),
            Value::Array(
                highlights(&result.content)
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
        );
    }

    let action_items = extract_list_items(final_report, ACTION_ITEM_LIMIT);
    let risk_items: Vec<String> = action_items
        .iter()
        .filter(|item| {
            let lowered = item.to_lowercase();
            ["risk", "compliance", "constraint", "restriction", "challenge"]
                .iter()
                .any(|k| lowered.contains(k))
        })
        .take(RISK_ITEM_LIMIT)
        .cloned()
        .collect();

    let revised_count = exchanges.iter().filter(|e| e.revised).count();

    json!({
        "version": "memory.v1",
        "session_id": session_id,
        "generated_at": generated_at,
        "entities": [
            {"kind": "target_market", "value": profile.target_market},
            {"kind": "supply_chain", "value": profile.supply_chain},
            {"kind": "seller_type", "value": profile.seller_type},
            {"kind": "price_range", "value": profile.price_range()},
        ],
        "summary": clip(final_report, 260),
        "agent_highlights": Value::Object(agent_highlights),
        "signals": {
            "agent_count": agent_results.len(),
            "debate_count": exchanges.len(),
            "revised_count": revised_count,
        },
        "action_items": action_items,
        "risk_items": risk_items,
    })
}

/// First few substantial lines of an agent's content, clipped to bullets.
fn highlights(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            clip(
                line.trim_start_matches(['-', '*', '+']).trim(),
                120,
            )
        })
        .filter(|line| line.split_whitespace().count() >= 3)
        .take(HIGHLIGHT_LIMIT)
        .collect()
}

fn extract_list_items(markdown: &str, limit: usize) -> Vec<String> {
    let mut items = Vec::new();
    for line in markdown.lines() {
        if let Some(captures) = list_item_regex().captures(line) {
            if let Some(item) = captures.get(1) {
                let value = clip(item.as_str(), 120);
                if !value.is_empty() {
                    items.push(value);
                }
            }
        }
        if items.len() >= limit {
            break;
        }
    }
    items
}

fn clip(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let clipped: String = trimmed.chars().take(limit.saturating_sub(1)).collect();
    format!("{}…", clipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentName;
    use crate::events::{AgentStatus, DebateType};

    fn result(agent: &str, content: &str) -> AgentResultRecord {
        let mut record = AgentResultRecord::started("s-1", agent);
        record.status = AgentStatus::Completed;
        record.content = content.to_string();
        record
    }

    fn exchange(revised: bool) -> ExchangeSummary {
        ExchangeSummary {
            round_number: 1,
            debate_type: DebateType::PeerReview,
            challenger: AgentName::TrendScout,
            responder: AgentName::CompetitorAnalyst,
            revised,
            completed: true,
        }
    }

    #[test]
    fn test_snapshot_structure() {
        let results = vec![result(
            "trend_scout",
            "## Trends\n\n- Wireless demand keeps climbing fast\n- Battery tech is maturing well",
        )];
        let snapshot = build_memory_snapshot(
            "s-1",
            &Profile {
                target_market: "Germany".to_string(),
                ..Default::default()
            },
            &results,
            &[exchange(true), exchange(false)],
            "# Report\n\n- Launch within two quarters to catch the window\n- Compliance risk: CE marking needs lead time",
            "2026-01-01T00:00:00Z",
        );

        assert_eq!(snapshot["session_id"], "s-1");
        assert_eq!(snapshot["entities"][0]["value"], "Germany");
        assert_eq!(snapshot["signals"]["debate_count"], 2);
        assert_eq!(snapshot["signals"]["revised_count"], 1);

        let highlights = snapshot["agent_highlights"]["trend_scout"].as_array().unwrap();
        assert!(!highlights.is_empty());
        assert!(highlights[0].as_str().unwrap().contains("Wireless demand"));

        let actions = snapshot["action_items"].as_array().unwrap();
        assert_eq!(actions.len(), 2);
        let risks = snapshot["risk_items"].as_array().unwrap();
        assert_eq!(risks.len(), 1);
        assert!(risks[0].as_str().unwrap().contains("Compliance"));
    }

    #[test]
    fn test_highlights_skip_headings_and_short_lines() {
        let items = highlights("# Title\n\nok\nThis line is long enough to keep around\n");
        assert_eq!(items.len(), 1);
        assert!(items[0].contains("long enough"));
    }

    #[test]
    fn test_empty_report() {
        let snapshot =
            build_memory_snapshot("s-1", &Profile::default(), &[], &[], "", "2026-01-01T00:00:00Z");
        assert_eq!(snapshot["summary"], "");
        assert!(snapshot["action_items"].as_array().unwrap().is_empty());
    }
}
