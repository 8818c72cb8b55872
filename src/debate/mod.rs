//! Debate coordination.
//!
//! Round 1 is peer review: the two fixed analyst pairs challenge each other
//! bidirectionally. Round 2 is red team: the critique agent challenges each
//! analyst in turn. Exchanges for one responder are strictly sequential;
//! different responders run concurrently. A responder's revision can replace
//! its stored gather result — the only path by which a gather result mutates
//! after the join barrier.

use std::collections::HashMap;

use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::agents::stage::{stream_call, ChunkMode, StageError, StageServices};
use crate::agents::{prompts, AgentName};
use crate::config::{DebateConfig, DEBATE_PEER_PAIRS, DEBATE_REDTEAM_TARGETS};
use crate::events::{AgentStatus, DebateType, WorkflowEvent};
use crate::policy::{DegradeMode, RetryPolicy};
use crate::store::AgentResultRecord;

/// Compact record of one exchange, fed to consensus and the synthesizer.
#[derive(Debug, Clone)]
pub struct ExchangeSummary {
    pub round_number: u32,
    pub debate_type: DebateType,
    pub challenger: AgentName,
    pub responder: AgentName,
    pub revised: bool,
    pub completed: bool,
}

/// Lifecycle state of a debate round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    NotStarted,
    Running,
    Completed,
    PartiallyCompleted,
}

/// Terminal outcome of one round.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub round_number: u32,
    pub debate_type: DebateType,
    pub exchanges: Vec<ExchangeSummary>,
    pub fatal: bool,
    pub cancelled: bool,
}

impl RoundOutcome {
    /// A round completes when every planned exchange terminalized cleanly;
    /// degraded or skipped exchanges leave it partially completed.
    pub fn state(&self) -> RoundState {
        if self.exchanges.iter().all(|e| e.completed) {
            RoundState::Completed
        } else {
            RoundState::PartiallyCompleted
        }
    }
}

/// Settings shared by every exchange in a run.
#[derive(Debug, Clone)]
pub struct DebateSettings {
    pub retry: RetryPolicy,
    pub degrade: DegradeMode,
    pub enable_followup: bool,
    pub enable_websearch: bool,
    pub tuning: DebateConfig,
}

/// Run one debate round to completion, mutating `results` in place when a
/// revision replaces a stored analysis.
pub async fn run_round(
    services: &StageServices,
    round_number: u32,
    debate_type: DebateType,
    results: &mut HashMap<AgentName, AgentResultRecord>,
    settings: &DebateSettings,
) -> Result<RoundOutcome, StageError> {
    let plan = plan_exchanges(debate_type, results);
    let participants: Vec<String> = plan
        .iter()
        .flat_map(|(c, r)| [c.as_str().to_string(), r.as_str().to_string()])
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    services
        .pipe
        .emit(WorkflowEvent::DebateRoundStart {
            round_number,
            debate_type,
            participants,
            timestamp: Utc::now(),
        })
        .await?;

    info!(round_number, debate_type = %debate_type, exchanges = plan.len(), "debate round started");

    // Different responders in parallel; the plan never schedules the same
    // responder twice in a round, so per-responder ordering is trivial.
    let futures = plan.iter().map(|(challenger, responder)| {
        let original = results
            .get(responder)
            .map(|r| r.content.clone())
            .unwrap_or_default();
        run_exchange(
            services,
            round_number,
            debate_type,
            *challenger,
            *responder,
            original,
            settings,
        )
    });
    let outcomes: Vec<ExchangeResult> = join_all(futures).await;

    let mut exchanges = Vec::new();
    let mut fatal = false;
    let mut cancelled = false;

    for outcome in outcomes {
        match outcome {
            ExchangeResult::Done { summary, revision } => {
                if let Some(content) = revision {
                    if let Some(record) = results.get_mut(&summary.responder) {
                        record.content = content.clone();
                    }
                    services
                        .pipe
                        .sink
                        .apply_revision(summary.responder.as_str(), &content)
                        .await?;
                }
                exchanges.push(summary);
            }
            ExchangeResult::Fatal => fatal = true,
            ExchangeResult::Cancelled => cancelled = true,
        }
    }

    services
        .pipe
        .emit(WorkflowEvent::DebateRoundEnd {
            round_number,
            exchanges_count: exchanges.len(),
            timestamp: Utc::now(),
        })
        .await?;

    Ok(RoundOutcome {
        round_number,
        debate_type,
        exchanges,
        fatal,
        cancelled,
    })
}

/// Challenger/responder pairs for a round, restricted to analysts whose
/// gather stage produced usable content.
fn plan_exchanges(
    debate_type: DebateType,
    results: &HashMap<AgentName, AgentResultRecord>,
) -> Vec<(AgentName, AgentName)> {
    let usable = |agent: &AgentName| {
        results
            .get(agent)
            .map(|r| r.status == AgentStatus::Completed && !r.content.is_empty())
            .unwrap_or(false)
    };

    match debate_type {
        DebateType::PeerReview => {
            let mut plan = Vec::new();
            for (a, b) in DEBATE_PEER_PAIRS {
                if usable(&a) && usable(&b) {
                    plan.push((a, b));
                    plan.push((b, a));
                }
            }
            plan
        }
        DebateType::RedTeam => DEBATE_REDTEAM_TARGETS
            .into_iter()
            .filter(usable)
            .map(|target| (AgentName::DebateChallenger, target))
            .collect(),
    }
}

enum ExchangeResult {
    Done {
        summary: ExchangeSummary,
        /// Replacement content for the responder's stored result.
        revision: Option<String>,
    },
    Fatal,
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn run_exchange(
    services: &StageServices,
    round_number: u32,
    debate_type: DebateType,
    challenger: AgentName,
    responder: AgentName,
    original_content: String,
    settings: &DebateSettings,
) -> ExchangeResult {
    let exchange_id = format!("r{}:{}->{}", round_number, challenger, responder);
    let mut last_error = String::new();

    for attempt in 1..=settings.retry.max_attempts {
        if services.cancel.is_cancelled() {
            return ExchangeResult::Cancelled;
        }

        match attempt_exchange(
            services,
            round_number,
            debate_type,
            challenger,
            responder,
            &original_content,
            settings,
        )
        .await
        {
            Ok((summary, revision)) => return ExchangeResult::Done { summary, revision },
            Err(StageError::Cancelled) => return ExchangeResult::Cancelled,
            Err(e) => {
                last_error = e.to_string();
                if settings.retry.should_retry(attempt) {
                    let backoff_ms = settings.retry.backoff_for(attempt, &exchange_id);
                    let emitted = services
                        .pipe
                        .emit(WorkflowEvent::Retry {
                            target_type: "debate_exchange".to_string(),
                            target_id: exchange_id.clone(),
                            attempt,
                            max_attempts: settings.retry.max_attempts,
                            error: last_error.clone(),
                            backoff_ms,
                            timestamp: Utc::now(),
                        })
                        .await;
                    if emitted.is_err() {
                        return ExchangeResult::Fatal;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                }
            }
        }
    }

    warn!(exchange = %exchange_id, error = %last_error, "debate exchange failed after retries");

    match settings.degrade {
        DegradeMode::Fail => ExchangeResult::Fatal,
        DegradeMode::Skip => ExchangeResult::Done {
            summary: ExchangeSummary {
                round_number,
                debate_type,
                challenger,
                responder,
                revised: false,
                completed: false,
            },
            revision: None,
        },
        DegradeMode::Partial => {
            // Record the failed exchange so the audit trail shows the
            // attempt; the follow-up slot carries the failure note.
            let note = format!("[degraded] exchange failed: {}", last_error);
            let events = [
                WorkflowEvent::AgentChallengeEnd {
                    round_number,
                    from_agent: challenger.as_str().to_string(),
                    to_agent: responder.as_str().to_string(),
                    challenge_content: String::new(),
                    timestamp: Utc::now(),
                },
                WorkflowEvent::AgentRespondEnd {
                    round_number,
                    from_agent: responder.as_str().to_string(),
                    to_agent: challenger.as_str().to_string(),
                    response_content: String::new(),
                    revised: false,
                    timestamp: Utc::now(),
                },
                WorkflowEvent::AgentFollowupEnd {
                    round_number,
                    from_agent: challenger.as_str().to_string(),
                    to_agent: responder.as_str().to_string(),
                    followup_content: note,
                    timestamp: Utc::now(),
                },
            ];
            for event in events {
                if services.pipe.emit(event).await.is_err() {
                    return ExchangeResult::Fatal;
                }
            }
            ExchangeResult::Done {
                summary: ExchangeSummary {
                    round_number,
                    debate_type,
                    challenger,
                    responder,
                    revised: false,
                    completed: false,
                },
                revision: None,
            }
        }
    }
}

async fn attempt_exchange(
    services: &StageServices,
    round_number: u32,
    debate_type: DebateType,
    challenger: AgentName,
    responder: AgentName,
    original_content: &str,
    settings: &DebateSettings,
) -> Result<(ExchangeSummary, Option<String>), StageError> {
    // Step 1: challenge.
    services
        .pipe
        .emit(WorkflowEvent::AgentChallenge {
            round_number,
            from_agent: challenger.as_str().to_string(),
            to_agent: responder.as_str().to_string(),
            timestamp: Utc::now(),
        })
        .await?;

    let challenge_user =
        prompts::challenge_prompt(debate_type, challenger, responder, original_content);
    let challenge = stream_call(
        services,
        challenger,
        &prompts::system_prompt(challenger),
        &challenge_user,
        settings.enable_websearch,
        ChunkMode::Silent,
        "challenge",
    )
    .await?;
    let challenge_content = pick_body(&challenge.content, &challenge.thinking);

    services
        .pipe
        .emit(WorkflowEvent::AgentChallengeEnd {
            round_number,
            from_agent: challenger.as_str().to_string(),
            to_agent: responder.as_str().to_string(),
            challenge_content: challenge_content.clone(),
            timestamp: Utc::now(),
        })
        .await?;

    // Step 2: response.
    services
        .pipe
        .emit(WorkflowEvent::AgentRespond {
            round_number,
            from_agent: responder.as_str().to_string(),
            to_agent: challenger.as_str().to_string(),
            timestamp: Utc::now(),
        })
        .await?;

    let response = stream_call(
        services,
        responder,
        &prompts::system_prompt(responder),
        &prompts::response_prompt(&challenge_content, original_content),
        settings.enable_websearch,
        ChunkMode::Silent,
        "respond",
    )
    .await?;
    let response_content = pick_body(&response.content, &response.thinking);
    let revised = assess_revision(&response_content, original_content, &settings.tuning);

    services
        .pipe
        .emit(WorkflowEvent::AgentRespondEnd {
            round_number,
            from_agent: responder.as_str().to_string(),
            to_agent: challenger.as_str().to_string(),
            response_content: response_content.clone(),
            revised,
            timestamp: Utc::now(),
        })
        .await?;

    // Step 3: optional follow-up by the same challenger.
    if settings.enable_followup {
        services
            .pipe
            .emit(WorkflowEvent::AgentFollowup {
                round_number,
                from_agent: challenger.as_str().to_string(),
                to_agent: responder.as_str().to_string(),
                timestamp: Utc::now(),
            })
            .await?;

        let followup = stream_call(
            services,
            challenger,
            &prompts::system_prompt(challenger),
            &prompts::followup_prompt(&challenge_content, &response_content),
            settings.enable_websearch,
            ChunkMode::Silent,
            "followup",
        )
        .await?;

        services
            .pipe
            .emit(WorkflowEvent::AgentFollowupEnd {
                round_number,
                from_agent: challenger.as_str().to_string(),
                to_agent: responder.as_str().to_string(),
                followup_content: pick_body(&followup.content, &followup.thinking),
                timestamp: Utc::now(),
            })
            .await?;
    }

    let revision = if revised
        && diff_ratio(&response_content, original_content)
            > settings.tuning.revision_replace_threshold
    {
        Some(strip_revision_footer(&response_content))
    } else {
        None
    };

    Ok((
        ExchangeSummary {
            round_number,
            debate_type,
            challenger,
            responder,
            revised,
            completed: true,
        },
        revision,
    ))
}

/// Debate calls run with chunking silenced, so a model that only used the
/// thinking channel still yields usable text.
fn pick_body(content: &str, thinking: &Option<String>) -> String {
    if !content.trim().is_empty() {
        content.trim().to_string()
    } else {
        thinking.as_deref().unwrap_or_default().trim().to_string()
    }
}

/// Decide the `revised` flag. Order: structured footer, explicit revision
/// language, then content-diff threshold. Any positive signal wins.
pub fn assess_revision(response: &str, original: &str, tuning: &DebateConfig) -> bool {
    if let Some(footer) = revision_footer(response) {
        if footer {
            return true;
        }
        // Footer said no; only a large content shift overrides it.
        return diff_ratio(response, original) > tuning.revision_diff_threshold;
    }

    let lowered = response.to_lowercase();
    let signals = [
        "i will revise",
        "i revise my",
        "revised conclusion",
        "i am updating",
        "updating my conclusion",
        "i have revised",
    ];
    if signals.iter().any(|s| lowered.contains(s)) {
        return true;
    }

    diff_ratio(response, original) > tuning.revision_diff_threshold
}

/// Parse the terminal `REVISION: yes|no` footer, if present.
fn revision_footer(response: &str) -> Option<bool> {
    for line in response.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_lowercase();
        if let Some(rest) = lowered.strip_prefix("revision:") {
            return match rest.trim() {
                "yes" => Some(true),
                "no" => Some(false),
                _ => None,
            };
        }
        return None;
    }
    None
}

fn strip_revision_footer(response: &str) -> String {
    let trimmed = response.trim_end();
    if let Some(idx) = trimmed.to_lowercase().rfind("revision:") {
        let (head, tail) = trimmed.split_at(idx);
        // Only strip when the footer is the final line.
        if !tail.contains('\n') {
            return head.trim_end().to_string();
        }
    }
    trimmed.to_string()
}

/// Word-level dissimilarity in [0, 1]: 0 = identical bags of words.
pub fn diff_ratio(a: &str, b: &str) -> f64 {
    fn count(text: &str) -> HashMap<&str, usize> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in text.split_whitespace() {
            *counts.entry(token).or_default() += 1;
        }
        counts
    }
    let counts_a = count(a);
    let counts_b = count(b);
    let total: usize = counts_a.values().sum::<usize>() + counts_b.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let common: usize = counts_a
        .iter()
        .map(|(token, n)| counts_b.get(token).copied().unwrap_or(0).min(*n))
        .sum();
    1.0 - (2.0 * common as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AgentStatus;

    fn tuning() -> DebateConfig {
        DebateConfig {
            revision_diff_threshold: 0.35,
            revision_replace_threshold: 0.30,
        }
    }

    fn results_with(agents: &[AgentName]) -> HashMap<AgentName, AgentResultRecord> {
        agents
            .iter()
            .map(|agent| {
                let mut record = AgentResultRecord::started("s-1", agent.as_str());
                record.status = AgentStatus::Completed;
                record.content = format!("analysis from {}", agent);
                (*agent, record)
            })
            .collect()
    }

    #[test]
    fn test_peer_plan_is_bidirectional() {
        let results = results_with(&crate::agents::WORKER_AGENTS);
        let plan = plan_exchanges(DebateType::PeerReview, &results);
        assert_eq!(plan.len(), 4);
        assert!(plan.contains(&(AgentName::TrendScout, AgentName::CompetitorAnalyst)));
        assert!(plan.contains(&(AgentName::CompetitorAnalyst, AgentName::TrendScout)));
    }

    #[test]
    fn test_peer_plan_skips_incomplete_pairs() {
        let results = results_with(&[
            AgentName::TrendScout,
            AgentName::RegulationChecker,
            AgentName::SocialSentinel,
        ]);
        let plan = plan_exchanges(DebateType::PeerReview, &results);
        // Trend pair is broken (competitor missing); regulation pair intact.
        assert_eq!(plan.len(), 2);
        assert!(plan
            .iter()
            .all(|(c, r)| *c != AgentName::CompetitorAnalyst && *r != AgentName::CompetitorAnalyst));
    }

    #[test]
    fn test_redteam_plan_targets_completed_workers() {
        let results = results_with(&[AgentName::TrendScout, AgentName::SocialSentinel]);
        let plan = plan_exchanges(DebateType::RedTeam, &results);
        assert_eq!(plan.len(), 2);
        assert!(plan
            .iter()
            .all(|(c, _)| *c == AgentName::DebateChallenger));
    }

    #[test]
    fn test_footer_yes_wins() {
        assert!(assess_revision(
            "I concede the point.\n\nREVISION: yes",
            "original text here",
            &tuning()
        ));
    }

    #[test]
    fn test_footer_no_with_similar_content() {
        let original = "the market is growing quickly in this segment";
        let response = format!("{}\n\nREVISION: no", original);
        assert!(!assess_revision(&response, original, &tuning()));
    }

    #[test]
    fn test_explicit_language_signal() {
        let original = "stable conclusion about the market over many words here";
        let response = format!("{} and therefore I will revise the risk rating", original);
        assert!(assess_revision(&response, original, &tuning()));
    }

    #[test]
    fn test_large_diff_triggers_revision() {
        let original = "alpha beta gamma delta epsilon";
        let response = "completely different wording with no overlap whatsoever";
        assert!(assess_revision(response, original, &tuning()));
    }

    #[test]
    fn test_diff_ratio_bounds() {
        assert_eq!(diff_ratio("a b c", "a b c"), 0.0);
        assert_eq!(diff_ratio("a b", "c d"), 1.0);
        assert_eq!(diff_ratio("", ""), 0.0);
        let mid = diff_ratio("a b c d", "a b x y");
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn test_strip_revision_footer() {
        assert_eq!(
            strip_revision_footer("Updated analysis.\nREVISION: yes"),
            "Updated analysis."
        );
        assert_eq!(
            strip_revision_footer("No footer at all"),
            "No footer at all"
        );
    }

    #[test]
    fn test_round_state() {
        let mut outcome = RoundOutcome {
            round_number: 1,
            debate_type: DebateType::PeerReview,
            exchanges: vec![ExchangeSummary {
                round_number: 1,
                debate_type: DebateType::PeerReview,
                challenger: AgentName::TrendScout,
                responder: AgentName::CompetitorAnalyst,
                revised: false,
                completed: true,
            }],
            fatal: false,
            cancelled: false,
        };
        assert_eq!(outcome.state(), RoundState::Completed);

        outcome.exchanges[0].completed = false;
        assert_eq!(outcome.state(), RoundState::PartiallyCompleted);
    }

    #[test]
    fn test_pick_body_prefers_content() {
        assert_eq!(
            pick_body("report", &Some("thinking".to_string())),
            "report"
        );
        assert_eq!(pick_body("  ", &Some("thinking".to_string())), "thinking");
        assert_eq!(pick_body("", &None), "");
    }
}
