//! Graph engine.
//!
//! Executes the fixed pipeline shape: a parallel gather fan-out over the
//! four analysts, a join barrier, zero to two debate rounds, the terminal
//! synthesizer, and the evidence/memory packers. Every state change is
//! written through the persistence sink before the matching event reaches
//! the bus, so `/status/{id}` always covers what any client has seen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::agents::stage::{
    self, stream_call, ChunkMode, StageError, StageOutcome, StageServices,
};
use crate::agents::{prompts, AgentContext, AgentName, Profile, WORKER_AGENTS};
use crate::config::AppConfig;
use crate::debate::{self, DebateSettings, ExchangeSummary};
use crate::events::{AgentStatus, DebateType, SharedEventBus, WorkflowEvent};
use crate::evidence::build_evidence_pack;
use crate::llm::ChatModel;
use crate::memory::build_memory_snapshot;
use crate::policy::{DegradeMode, RetryPolicy};
use crate::store::sink::FinalOutput;
use crate::store::{
    AgentResultRecord, SessionEventSink, SessionRecord, SessionStatus, SessionUpdate, SharedStore,
    StoreError, WorkflowPhase,
};
use crate::tools::ToolRegistry;

/// Error type for engine runs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for engine runs.
pub type EngineResult<T> = Result<T, EngineError>;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
    Cancelled,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Cooperative cancellation signal. Stages check it between stream chunks
/// and before tool invocations.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// The sending half held by whoever may cancel the run.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a linked cancel handle/token pair.
pub fn cancel_channel() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Durable-then-visible event path: sink first, bus second.
#[derive(Clone)]
pub struct EventPipe {
    pub sink: Arc<SessionEventSink>,
    pub bus: SharedEventBus,
}

impl EventPipe {
    pub async fn emit(&self, event: WorkflowEvent) -> Result<(), StoreError> {
        self.sink.apply(&event).await?;
        self.bus.publish(event);
        Ok(())
    }

    pub async fn emit_all(&self, events: Vec<WorkflowEvent>) -> Result<(), StoreError> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }
}

/// Validated configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub session_id: String,
    pub profile: Profile,
    pub debate_rounds: u32,
    pub enable_followup: bool,
    pub enable_websearch: bool,
    pub retry: RetryPolicy,
    pub degrade: DegradeMode,
}

impl RunConfig {
    /// Normalize raw request values: rounds clamp to the implemented graph,
    /// attempts to at least one.
    pub fn normalized(mut self) -> Self {
        self.debate_rounds = self.debate_rounds.min(2);
        self.retry = RetryPolicy::new(self.retry.max_attempts, self.retry.backoff_ms);
        self
    }
}

/// The orchestration kernel. One instance serves the whole process; each
/// `run` gets its own sink, registry, and event pipe.
pub struct GraphEngine {
    config: Arc<AppConfig>,
    model: Option<Arc<dyn ChatModel>>,
    store: SharedStore,
}

impl GraphEngine {
    pub fn new(
        config: Arc<AppConfig>,
        model: Option<Arc<dyn ChatModel>>,
        store: SharedStore,
    ) -> Self {
        Self {
            config,
            model,
            store,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Execute one session to a terminal status, publishing events on `bus`.
    pub async fn run(
        &self,
        run: RunConfig,
        bus: SharedEventBus,
        cancel: CancelToken,
    ) -> EngineResult<TerminalStatus> {
        let run = run.normalized();
        let session = SessionRecord::new(
            &run.session_id,
            run.profile.clone(),
            run.debate_rounds,
            run.enable_followup,
            run.enable_websearch,
        );

        let sink = Arc::new(SessionEventSink::create(self.store.clone(), &session).await?);
        let pipe = EventPipe {
            sink: sink.clone(),
            bus,
        };
        let registry = Arc::new(ToolRegistry::new(
            &run.session_id,
            self.config.guardrail.clone(),
            self.config.pricing.clone(),
        ));
        let services = StageServices {
            config: self.config.clone(),
            model: self.model.clone(),
            registry,
            pipe: pipe.clone(),
            cancel,
        };

        let deadline = std::time::Duration::from_secs(self.config.limits.run_deadline_secs);
        let outcome = tokio::time::timeout(deadline, self.run_inner(&run, &services)).await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!(session_id = %run.session_id, error = %e, "run aborted on store error");
                let _ = pipe
                    .emit(WorkflowEvent::Error {
                        session_id: Some(run.session_id.clone()),
                        error: format!("persistence failure: {}", e),
                        timestamp: Utc::now(),
                    })
                    .await;
                TerminalStatus::Failed
            }
            Err(_) => {
                error!(session_id = %run.session_id, "run deadline exceeded");
                let _ = pipe
                    .emit(WorkflowEvent::Error {
                        session_id: Some(run.session_id.clone()),
                        error: "run deadline exceeded".to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
                TerminalStatus::Failed
            }
        };

        sink.close().await;
        info!(session_id = %run.session_id, status = status.as_str(), "run finished");
        Ok(status)
    }

    async fn run_inner(
        &self,
        run: &RunConfig,
        services: &StageServices,
    ) -> Result<TerminalStatus, StoreError> {
        let pipe = &services.pipe;

        pipe.emit(WorkflowEvent::OrchestratorStart {
            session_id: run.session_id.clone(),
            agents: WORKER_AGENTS.iter().map(|a| a.as_str().to_string()).collect(),
            debate_rounds: run.debate_rounds,
            timestamp: Utc::now(),
        })
        .await?;

        // ---- Gather: fan out the four analysts, join on all terminal. ----
        let ctx = AgentContext::new(&run.session_id, run.profile.clone());
        let mut join_set: JoinSet<Result<StageOutcome, StageError>> = JoinSet::new();
        for agent in WORKER_AGENTS {
            let services = services.clone();
            let ctx = ctx.clone();
            let retry = run.retry;
            let degrade = run.degrade;
            let enable_websearch = run.enable_websearch;
            join_set.spawn(async move {
                stage::run_worker(
                    &services,
                    agent,
                    &ctx,
                    retry,
                    degrade,
                    enable_websearch,
                    stage::worker_stagger_ms(agent),
                )
                .await
            });
        }

        let mut results: HashMap<AgentName, AgentResultRecord> = HashMap::new();
        let mut fatal_errors: Vec<String> = Vec::new();
        let mut cancelled = false;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    if outcome.cancelled {
                        cancelled = true;
                    }
                    if outcome.fatal {
                        // Collect every failure before applying the policy so
                        // diagnostics are complete.
                        fatal_errors.push(format!(
                            "{}: {}",
                            outcome.agent,
                            outcome.record.error_message.clone().unwrap_or_default()
                        ));
                    }
                    results.insert(outcome.agent, outcome.record);
                }
                Ok(Err(e)) => {
                    if e.is_cancelled() {
                        cancelled = true;
                    } else {
                        fatal_errors.push(e.to_string());
                    }
                }
                Err(e) => fatal_errors.push(format!("worker panicked: {}", e)),
            }
        }

        if cancelled {
            return self.finish_cancelled(run, services).await;
        }
        if !fatal_errors.is_empty() && run.degrade == DegradeMode::Fail {
            return self.finish_failed(run, services, fatal_errors.join("; ")).await;
        }

        // ---- Debate rounds. ----
        let settings = DebateSettings {
            retry: run.retry,
            degrade: run.degrade,
            enable_followup: run.enable_followup,
            enable_websearch: run.enable_websearch,
            tuning: self.config.debate.clone(),
        };

        let mut exchanges: Vec<ExchangeSummary> = Vec::new();
        for round_number in 1..=run.debate_rounds {
            let debate_type = if round_number == 1 {
                DebateType::PeerReview
            } else {
                DebateType::RedTeam
            };
            let outcome =
                debate::run_round(services, round_number, debate_type, &mut results, &settings)
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?;

            if outcome.cancelled || services.cancel.is_cancelled() {
                return self.finish_cancelled(run, services).await;
            }
            if outcome.fatal {
                return self
                    .finish_failed(
                        run,
                        services,
                        format!("debate round {} failed", round_number),
                    )
                    .await;
            }
            exchanges.extend(outcome.exchanges);
        }

        if run.debate_rounds > 0 {
            let revised = exchanges.iter().filter(|e| e.revised).count();
            let total = exchanges.len().max(1);
            pipe.emit(WorkflowEvent::ConsensusReached {
                summary: Some(format!(
                    "{} of {} debate responses revised their analysis",
                    revised,
                    exchanges.len()
                )),
                confidence: Some(1.0 - revised as f64 / total as f64),
                timestamp: Utc::now(),
            })
            .await?;
        }

        // ---- Synthesize. ----
        services
            .pipe
            .sink
            .update_session(SessionUpdate {
                phase: Some(WorkflowPhase::Synthesize),
                ..Default::default()
            })
            .await?;

        let report = match self
            .run_synthesizer(run, services, &results, &exchanges)
            .await?
        {
            SynthesisOutcome::Report(report) => report,
            SynthesisOutcome::Fatal(message) => {
                return self.finish_failed(run, services, message).await;
            }
            SynthesisOutcome::Cancelled => {
                return self.finish_cancelled(run, services).await;
            }
        };

        // ---- Evidence + memory packs (best effort). ----
        let generated_at = Utc::now().to_rfc3339();
        let ordered_results: Vec<AgentResultRecord> = WORKER_AGENTS
            .iter()
            .filter_map(|agent| results.get(agent).cloned())
            .collect();
        let tool_invocations = match self.store.list_tool_invocations(&run.session_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "tool invocations unavailable for evidence pack");
                Vec::new()
            }
        };
        let evidence = build_evidence_pack(
            &run.session_id,
            &run.profile,
            &ordered_results,
            &tool_invocations,
            &report,
            &generated_at,
        );
        let memory = build_memory_snapshot(
            &run.session_id,
            &run.profile,
            &ordered_results,
            &exchanges,
            &report,
            &generated_at,
        );

        pipe.emit(WorkflowEvent::OrchestratorEnd {
            session_id: run.session_id.clone(),
            final_report: report,
            report_html_url: None,
            evidence_pack: Some(evidence),
            memory_snapshot: Some(memory),
            timestamp: Utc::now(),
        })
        .await?;

        Ok(TerminalStatus::Completed)
    }

    async fn run_synthesizer(
        &self,
        run: &RunConfig,
        services: &StageServices,
        results: &HashMap<AgentName, AgentResultRecord>,
        exchanges: &[ExchangeSummary],
    ) -> Result<SynthesisOutcome, StoreError> {
        let pipe = &services.pipe;
        let started = Instant::now();
        let agent = AgentName::Synthesizer;

        pipe.emit(WorkflowEvent::AgentStart {
            agent: agent.as_str().to_string(),
            task: Some(agent.description().to_string()),
            timestamp: Utc::now(),
        })
        .await?;

        let mut ctx = AgentContext::new(&run.session_id, run.profile.clone());
        ctx.other_agent_outputs = WORKER_AGENTS
            .iter()
            .filter_map(|a| results.get(a))
            .filter(|r| !r.content.is_empty())
            .cloned()
            .collect();
        ctx.debate_round = run.debate_rounds;

        let has_content = !ctx.other_agent_outputs.is_empty();
        let digest = debate_digest(exchanges);

        if self.model.is_some() && has_content {
            let system = prompts::system_prompt(agent);
            let user = prompts::synthesizer_user_prompt(&ctx, &digest);
            let mut last_error = String::new();

            for attempt in 1..=run.retry.max_attempts {
                if services.cancel.is_cancelled() {
                    return Ok(SynthesisOutcome::Cancelled);
                }
                match stream_call(
                    services,
                    agent,
                    &system,
                    &user,
                    false,
                    ChunkMode::Emit,
                    "synthesize",
                )
                .await
                {
                    Ok(output) => {
                        let report =
                            crate::agents::extract::normalize_report(&output.content, "Market Insight Report");
                        let duration_ms = started.elapsed().as_millis() as u64;
                        pipe.sink
                            .set_final_output(
                                agent.as_str(),
                                FinalOutput {
                                    content: report.clone(),
                                    thinking: output.thinking,
                                    sources: output.sources,
                                    confidence: 1.0,
                                },
                            )
                            .await;
                        pipe.emit(WorkflowEvent::AgentEnd {
                            agent: agent.as_str().to_string(),
                            status: AgentStatus::Completed,
                            duration_ms,
                            attempt,
                            error: None,
                            timestamp: Utc::now(),
                        })
                        .await?;
                        return Ok(SynthesisOutcome::Report(report));
                    }
                    Err(StageError::Cancelled) => return Ok(SynthesisOutcome::Cancelled),
                    Err(e) => {
                        last_error = e.to_string();
                        if run.retry.should_retry(attempt) {
                            let backoff_ms = run.retry.backoff_for(attempt, agent.as_str());
                            pipe.emit(WorkflowEvent::Retry {
                                target_type: "agent".to_string(),
                                target_id: agent.as_str().to_string(),
                                attempt,
                                max_attempts: run.retry.max_attempts,
                                error: last_error.clone(),
                                backoff_ms,
                                timestamp: Utc::now(),
                            })
                            .await?;
                            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        }
                    }
                }
            }

            // Synthesis retries exhausted.
            error!(error = %last_error, "synthesizer failed after retries");
            pipe.emit(WorkflowEvent::AgentError {
                agent: agent.as_str().to_string(),
                error: last_error.clone(),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                timestamp: Utc::now(),
            })
            .await?;

            if run.degrade == DegradeMode::Fail {
                pipe.emit(WorkflowEvent::AgentEnd {
                    agent: agent.as_str().to_string(),
                    status: AgentStatus::Failed,
                    duration_ms: started.elapsed().as_millis() as u64,
                    attempt: run.retry.max_attempts,
                    error: Some(last_error.clone()),
                    timestamp: Utc::now(),
                })
                .await?;
                return Ok(SynthesisOutcome::Fatal(last_error));
            }

            // Partial/skip keep the run alive on the assembled fallback; the
            // terminal stage itself lands as failed or skipped.
            let status = if run.degrade == DegradeMode::Skip {
                AgentStatus::Skipped
            } else {
                AgentStatus::Failed
            };
            let report = fallback_report(results, exchanges);
            pipe.sink
                .set_final_output(
                    agent.as_str(),
                    FinalOutput {
                        content: report.clone(),
                        thinking: None,
                        sources: Vec::new(),
                        confidence: 0.5,
                    },
                )
                .await;
            pipe.emit(WorkflowEvent::AgentEnd {
                agent: agent.as_str().to_string(),
                status,
                duration_ms: started.elapsed().as_millis() as u64,
                attempt: run.retry.max_attempts,
                error: Some(last_error),
                timestamp: Utc::now(),
            })
            .await?;
            return Ok(SynthesisOutcome::Report(report));
        }

        // No provider or nothing usable from gather: assemble directly.
        let report = fallback_report(results, exchanges);
        let status = if has_content {
            AgentStatus::Completed
        } else {
            AgentStatus::Degraded
        };
        pipe.sink
            .set_final_output(
                agent.as_str(),
                FinalOutput {
                    content: report.clone(),
                    thinking: None,
                    sources: Vec::new(),
                    confidence: if has_content { 1.0 } else { 0.3 },
                },
            )
            .await;
        pipe.emit(WorkflowEvent::AgentEnd {
            agent: agent.as_str().to_string(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            attempt: 1,
            error: if has_content {
                None
            } else {
                Some("no usable analyst output".to_string())
            },
            timestamp: Utc::now(),
        })
        .await?;
        Ok(SynthesisOutcome::Report(report))
    }

    async fn finish_failed(
        &self,
        run: &RunConfig,
        services: &StageServices,
        message: String,
    ) -> Result<TerminalStatus, StoreError> {
        services
            .pipe
            .emit(WorkflowEvent::Error {
                session_id: Some(run.session_id.clone()),
                error: message,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(TerminalStatus::Failed)
    }

    async fn finish_cancelled(
        &self,
        run: &RunConfig,
        services: &StageServices,
    ) -> Result<TerminalStatus, StoreError> {
        // The cancelled status lands first; the trailing error event cannot
        // regress it (terminal states are sticky) but closes the stream.
        services
            .pipe
            .sink
            .update_session(SessionUpdate {
                status: Some(SessionStatus::Cancelled),
                error_message: Some("cancelled".to_string()),
                completed_at: Some(Utc::now()),
                ..Default::default()
            })
            .await?;
        services
            .pipe
            .emit(WorkflowEvent::Error {
                session_id: Some(run.session_id.clone()),
                error: "cancelled".to_string(),
                timestamp: Utc::now(),
            })
            .await?;
        Ok(TerminalStatus::Cancelled)
    }
}

enum SynthesisOutcome {
    Report(String),
    Fatal(String),
    Cancelled,
}

/// Compact debate record for the synthesizer prompt.
fn debate_digest(exchanges: &[ExchangeSummary]) -> String {
    exchanges
        .iter()
        .map(|e| {
            format!(
                "- round {} ({}): {} challenged {}{}",
                e.round_number,
                e.debate_type,
                e.challenger,
                e.responder,
                if e.revised { " [revised]" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Report assembled without the synthesizer model: surviving sections plus
/// a failure appendix and the debate summary.
fn fallback_report(
    results: &HashMap<AgentName, AgentResultRecord>,
    exchanges: &[ExchangeSummary],
) -> String {
    let mut parts = vec!["# Market Insight Report".to_string()];
    let mut success_count = 0;

    for agent in WORKER_AGENTS {
        if let Some(record) = results.get(&agent) {
            if !record.content.is_empty() {
                success_count += 1;
                parts.push(format!("\n## {}\n\n{}", agent.display_name(), record.content));
            }
        }
    }

    let failed: Vec<&AgentResultRecord> = WORKER_AGENTS
        .iter()
        .filter_map(|a| results.get(a))
        .filter(|r| r.content.is_empty() && r.error_message.is_some())
        .collect();
    if !failed.is_empty() {
        parts.push("\n## Collection Issues".to_string());
        for record in failed {
            parts.push(format!(
                "- {}: {}",
                record.agent_name,
                record.error_message.clone().unwrap_or_default()
            ));
        }
    }

    if success_count == 0 {
        parts.push(
            "\n## Note\n\nNo upstream analysis was available for this session; this is a degraded report."
                .to_string(),
        );
    }

    if !exchanges.is_empty() {
        parts.push("\n## Debate Summary".to_string());
        parts.push(debate_digest(exchanges));
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_channel() {
        let (handle, token) = cancel_channel();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_run_config_normalization() {
        let run = RunConfig {
            session_id: "s".to_string(),
            profile: Profile::default(),
            debate_rounds: 9,
            enable_followup: true,
            enable_websearch: false,
            retry: RetryPolicy::new(0, 100),
            degrade: DegradeMode::Partial,
        }
        .normalized();
        assert_eq!(run.debate_rounds, 2);
        assert_eq!(run.retry.max_attempts, 1);
    }

    #[test]
    fn test_fallback_report_sections() {
        let mut results = HashMap::new();
        let mut ok = AgentResultRecord::started("s", "trend_scout");
        ok.content = "trend section".to_string();
        ok.status = AgentStatus::Completed;
        results.insert(AgentName::TrendScout, ok);

        let mut bad = AgentResultRecord::started("s", "competitor_analyst");
        bad.status = AgentStatus::Degraded;
        bad.error_message = Some("provider 500".to_string());
        results.insert(AgentName::CompetitorAnalyst, bad);

        let report = fallback_report(&results, &[]);
        assert!(report.contains("# Market Insight Report"));
        assert!(report.contains("trend section"));
        assert!(report.contains("Collection Issues"));
        assert!(report.contains("provider 500"));
    }

    #[test]
    fn test_fallback_report_empty() {
        let report = fallback_report(&HashMap::new(), &[]);
        assert!(report.contains("degraded report"));
    }

    #[test]
    fn test_debate_digest_marks_revisions() {
        let digest = debate_digest(&[ExchangeSummary {
            round_number: 2,
            debate_type: DebateType::RedTeam,
            challenger: AgentName::DebateChallenger,
            responder: AgentName::TrendScout,
            revised: true,
            completed: true,
        }]);
        assert!(digest.contains("round 2"));
        assert!(digest.contains("[revised]"));
    }

    #[test]
    fn test_terminal_status_str() {
        assert_eq!(TerminalStatus::Completed.as_str(), "completed");
        assert_eq!(TerminalStatus::Failed.as_str(), "failed");
        assert_eq!(TerminalStatus::Cancelled.as_str(), "cancelled");
    }
}
