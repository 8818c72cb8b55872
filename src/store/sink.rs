//! Session event sink.
//!
//! Projects workflow events onto store rows. The engine writes every event
//! through here BEFORE publishing it on the bus, so anything a client saw
//! on the wire is already durable. Session, agent-result, and debate rows
//! are written synchronously; the append-only audit tables go through a
//! bounded background queue that never blocks the run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::events::{AgentStatus, DebateType, WorkflowEvent};

use super::{
    AgentResultRecord, DebateExchangeRecord, SessionRecord, SessionStatus, SessionUpdate,
    SharedStore, StoreResult, ToolInvocationRecord, WorkflowEventRecord, WorkflowPhase,
};

const AUDIT_QUEUE_CAPACITY: usize = 2048;

/// Final, normalized stage output installed before `agent_end` is applied.
#[derive(Debug, Clone, Default)]
pub struct FinalOutput {
    pub content: String,
    pub thinking: Option<String>,
    pub sources: Vec<String>,
    pub confidence: f64,
}

#[derive(Default)]
struct AgentBuf {
    content: Vec<String>,
    thinking: Vec<String>,
}

struct ExchangeBuf {
    debate_type: DebateType,
    challenge: String,
    response: String,
    followup: Option<String>,
    revised: bool,
    flushed: bool,
}

struct ToolStartBuf {
    started_at: DateTime<Utc>,
    input: Value,
    context: Option<String>,
    model_name: Option<String>,
    cache_hit: bool,
}

#[derive(Default)]
struct SinkState {
    agent_bufs: HashMap<String, AgentBuf>,
    agent_rows: HashMap<String, AgentResultRecord>,
    final_outputs: HashMap<String, FinalOutput>,
    exchanges: HashMap<(u32, String, String), ExchangeBuf>,
    tool_starts: HashMap<String, ToolStartBuf>,
    current_debate_type: Option<DebateType>,
}

enum AuditWrite {
    Event(WorkflowEventRecord),
    Tool(ToolInvocationRecord),
    Shutdown,
}

/// Per-session projection of events into the store.
pub struct SessionEventSink {
    store: SharedStore,
    session_id: String,
    enable_followup: bool,
    state: Mutex<SinkState>,
    audit_tx: mpsc::Sender<AuditWrite>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionEventSink {
    /// Create the session row (idempotently) and start the audit worker.
    pub async fn create(store: SharedStore, session: &SessionRecord) -> StoreResult<Self> {
        store.create_session(session).await?;

        let (audit_tx, mut audit_rx) = mpsc::channel::<AuditWrite>(AUDIT_QUEUE_CAPACITY);
        let worker_store = store.clone();
        let worker = tokio::spawn(async move {
            while let Some(write) = audit_rx.recv().await {
                let outcome = match &write {
                    AuditWrite::Event(record) => worker_store.insert_workflow_event(record).await,
                    AuditWrite::Tool(record) => worker_store.upsert_tool_invocation(record).await,
                    // FIFO channel: everything queued before the sentinel
                    // has already been written.
                    AuditWrite::Shutdown => break,
                };
                if let Err(e) = outcome {
                    warn!(error = %e, "audit write failed");
                }
            }
        });

        Ok(Self {
            store,
            session_id: session.id.clone(),
            enable_followup: session.enable_followup,
            state: Mutex::new(SinkState::default()),
            audit_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Install the normalized final output for an agent. Must happen before
    /// that agent's `agent_end` event is applied.
    pub async fn set_final_output(&self, agent: &str, output: FinalOutput) {
        self.state
            .lock()
            .await
            .final_outputs
            .insert(agent.to_string(), output);
    }

    /// Replace a stored agent result's content after a debate revision.
    pub async fn apply_revision(&self, agent: &str, content: &str) -> StoreResult<()> {
        let record = {
            let mut state = self.state.lock().await;
            match state.agent_rows.get_mut(agent) {
                Some(row) => {
                    row.content = content.to_string();
                    row.clone()
                }
                None => return Ok(()),
            }
        };
        self.store.upsert_agent_result(&record).await
    }

    /// Direct session update for transitions that have no event of their
    /// own (cancellation).
    pub async fn update_session(&self, update: SessionUpdate) -> StoreResult<()> {
        self.store.update_session(&self.session_id, update).await
    }

    /// Apply one event. Critical rows are durable when this returns; audit
    /// rows are queued.
    pub async fn apply(&self, event: &WorkflowEvent) -> StoreResult<()> {
        if !event.is_chunk() {
            self.enqueue_audit_event(event).await;
        }

        match event {
            WorkflowEvent::OrchestratorStart { timestamp, .. } => {
                self.update_session(SessionUpdate {
                    status: Some(SessionStatus::Running),
                    phase: Some(WorkflowPhase::Gather),
                    current_debate_round: Some(0),
                    started_at: Some(*timestamp),
                    ..Default::default()
                })
                .await
            }

            WorkflowEvent::OrchestratorEnd {
                final_report,
                report_html_url,
                evidence_pack,
                memory_snapshot,
                timestamp,
                ..
            } => {
                self.update_session(SessionUpdate {
                    status: Some(SessionStatus::Completed),
                    phase: Some(WorkflowPhase::Complete),
                    synthesized_report: Some(final_report.clone()),
                    report_html_url: report_html_url.clone(),
                    evidence_pack: evidence_pack.clone(),
                    memory_snapshot: memory_snapshot.clone(),
                    completed_at: Some(*timestamp),
                    ..Default::default()
                })
                .await
            }

            WorkflowEvent::Error { error, timestamp, .. } => {
                self.update_session(SessionUpdate {
                    status: Some(SessionStatus::Failed),
                    phase: Some(WorkflowPhase::Error),
                    error_message: Some(error.clone()),
                    completed_at: Some(*timestamp),
                    ..Default::default()
                })
                .await
            }

            WorkflowEvent::AgentStart { agent, .. } => {
                let record = AgentResultRecord::started(&self.session_id, agent);
                {
                    let mut state = self.state.lock().await;
                    state.agent_bufs.insert(agent.clone(), AgentBuf::default());
                    state.agent_rows.insert(agent.clone(), record.clone());
                }
                self.store.upsert_agent_result(&record).await
            }

            WorkflowEvent::AgentChunk { agent, content } => {
                let mut state = self.state.lock().await;
                state
                    .agent_bufs
                    .entry(agent.clone())
                    .or_default()
                    .content
                    .push(content.clone());
                Ok(())
            }

            WorkflowEvent::AgentThinkingChunk { agent, content } => {
                let mut state = self.state.lock().await;
                state
                    .agent_bufs
                    .entry(agent.clone())
                    .or_default()
                    .thinking
                    .push(content.clone());
                Ok(())
            }

            WorkflowEvent::AgentEnd {
                agent,
                status,
                duration_ms,
                error,
                timestamp,
                ..
            } => {
                let record = {
                    let mut state = self.state.lock().await;
                    let buf = state.agent_bufs.remove(agent).unwrap_or_default();
                    let final_output = state.final_outputs.remove(agent);

                    let mut record = state
                        .agent_rows
                        .get(agent)
                        .cloned()
                        .unwrap_or_else(|| AgentResultRecord::started(&self.session_id, agent));

                    match final_output {
                        Some(output) => {
                            record.content = output.content;
                            record.thinking = output.thinking;
                            record.sources = output.sources;
                            record.confidence = output.confidence;
                        }
                        None => {
                            record.content = buf.content.concat();
                            record.thinking = if buf.thinking.is_empty() {
                                None
                            } else {
                                Some(buf.thinking.concat())
                            };
                        }
                    }
                    record.status = *status;
                    record.duration_ms = Some(*duration_ms);
                    record.error_message = error.clone();
                    record.completed_at = Some(*timestamp);

                    state.agent_rows.insert(agent.clone(), record.clone());
                    record
                };
                self.store.upsert_agent_result(&record).await
            }

            WorkflowEvent::AgentError { agent, error, timestamp, .. } => {
                let record = {
                    let mut state = self.state.lock().await;
                    let mut record = state
                        .agent_rows
                        .get(agent)
                        .cloned()
                        .unwrap_or_else(|| AgentResultRecord::started(&self.session_id, agent));
                    record.status = AgentStatus::Failed;
                    record.error_message = Some(error.clone());
                    record.completed_at = Some(*timestamp);
                    state.agent_rows.insert(agent.clone(), record.clone());
                    record
                };
                self.store.upsert_agent_result(&record).await
            }

            WorkflowEvent::GuardrailTriggered { .. } => {
                self.update_session(SessionUpdate {
                    enable_websearch: Some(false),
                    ..Default::default()
                })
                .await
            }

            WorkflowEvent::DebateRoundStart {
                round_number,
                debate_type,
                ..
            } => {
                self.state.lock().await.current_debate_type = Some(*debate_type);
                let phase = match debate_type {
                    DebateType::PeerReview => WorkflowPhase::DebatePeer,
                    DebateType::RedTeam => WorkflowPhase::DebateRedteam,
                };
                self.update_session(SessionUpdate {
                    phase: Some(phase),
                    current_debate_round: Some(*round_number),
                    ..Default::default()
                })
                .await
            }

            WorkflowEvent::AgentChallengeEnd {
                round_number,
                from_agent,
                to_agent,
                challenge_content,
                ..
            } => {
                let mut state = self.state.lock().await;
                let debate_type = state.current_debate_type.unwrap_or(DebateType::PeerReview);
                let key = (*round_number, from_agent.clone(), to_agent.clone());
                state
                    .exchanges
                    .entry(key)
                    .or_insert_with(|| ExchangeBuf::new(debate_type))
                    .challenge = challenge_content.clone();
                Ok(())
            }

            WorkflowEvent::AgentRespondEnd {
                round_number,
                from_agent,
                to_agent,
                response_content,
                revised,
                ..
            } => {
                // The responder speaks back to the challenger; the exchange
                // key stays (challenger, responder).
                let key = (*round_number, to_agent.clone(), from_agent.clone());
                let should_flush = {
                    let mut state = self.state.lock().await;
                    let debate_type =
                        state.current_debate_type.unwrap_or(DebateType::PeerReview);
                    let buf = state
                        .exchanges
                        .entry(key.clone())
                        .or_insert_with(|| ExchangeBuf::new(debate_type));
                    buf.response = response_content.clone();
                    buf.revised = *revised;
                    !self.enable_followup
                };
                if should_flush {
                    self.flush_exchange(&key).await?;
                }
                Ok(())
            }

            WorkflowEvent::AgentFollowupEnd {
                round_number,
                from_agent,
                to_agent,
                followup_content,
                ..
            } => {
                let key = (*round_number, from_agent.clone(), to_agent.clone());
                {
                    let mut state = self.state.lock().await;
                    let debate_type =
                        state.current_debate_type.unwrap_or(DebateType::PeerReview);
                    state
                        .exchanges
                        .entry(key.clone())
                        .or_insert_with(|| ExchangeBuf::new(debate_type))
                        .followup = Some(followup_content.clone());
                }
                self.flush_exchange(&key).await
            }

            WorkflowEvent::DebateRoundEnd { round_number, .. } => {
                // Failure paths can leave exchanges without a follow-up;
                // the round boundary flushes whatever is still buffered.
                let pending: Vec<(u32, String, String)> = {
                    let state = self.state.lock().await;
                    state
                        .exchanges
                        .iter()
                        .filter(|(key, buf)| key.0 == *round_number && !buf.flushed)
                        .map(|(key, _)| key.clone())
                        .collect()
                };
                for key in pending {
                    self.flush_exchange(&key).await?;
                }
                Ok(())
            }

            WorkflowEvent::ToolStart {
                invocation_id,
                tool,
                agent,
                context,
                model_name,
                cache_hit,
                input,
                timestamp,
            } => {
                {
                    let mut state = self.state.lock().await;
                    state.tool_starts.insert(
                        invocation_id.clone(),
                        ToolStartBuf {
                            started_at: *timestamp,
                            input: input.clone(),
                            context: context.clone(),
                            model_name: Some(model_name.clone()),
                            cache_hit: *cache_hit,
                        },
                    );
                }
                let mut record =
                    ToolInvocationRecord::pending(&self.session_id, invocation_id, tool, Some(agent));
                record.context = context.clone();
                record.model_name = Some(model_name.clone());
                record.cache_hit = *cache_hit;
                record.input = Some(input.clone());
                record.started_at = Some(*timestamp);
                self.enqueue_audit_tool(record).await;
                Ok(())
            }

            WorkflowEvent::ToolEnd {
                invocation_id,
                tool,
                agent,
                context,
                model_name,
                cache_hit,
                input,
                output,
                duration_ms,
                estimated_input_tokens,
                estimated_output_tokens,
                estimated_cost_usd,
                timestamp,
                ..
            } => {
                let started = self.take_tool_start(invocation_id).await;
                let mut record =
                    ToolInvocationRecord::pending(&self.session_id, invocation_id, tool, Some(agent));
                record.status = "completed".to_string();
                record.context = context.clone();
                record.model_name = Some(model_name.clone());
                record.cache_hit = *cache_hit;
                record.input = Some(input.clone());
                record.output = Some(output.clone());
                record.duration_ms = Some(*duration_ms);
                record.estimated_input_tokens = Some(*estimated_input_tokens);
                record.estimated_output_tokens = Some(*estimated_output_tokens);
                record.estimated_cost_usd = Some(*estimated_cost_usd);
                record.started_at = Some(
                    started
                        .map(|s| s.started_at)
                        .unwrap_or_else(|| super::postgres::subtract_ms(*timestamp, *duration_ms)),
                );
                record.finished_at = Some(*timestamp);
                self.enqueue_audit_tool(record).await;
                Ok(())
            }

            WorkflowEvent::ToolError {
                invocation_id,
                tool,
                agent,
                error,
                duration_ms,
                timestamp,
            } => {
                let started = self.take_tool_start(invocation_id).await;
                let mut record =
                    ToolInvocationRecord::pending(&self.session_id, invocation_id, tool, Some(agent));
                record.status = "failed".to_string();
                record.error_message = Some(error.clone());
                record.duration_ms = Some(*duration_ms);
                if let Some(s) = started {
                    record.context = s.context;
                    record.model_name = s.model_name;
                    record.cache_hit = s.cache_hit;
                    record.input = Some(s.input);
                    record.started_at = Some(s.started_at);
                }
                record.finished_at = Some(*timestamp);
                self.enqueue_audit_tool(record).await;
                Ok(())
            }

            // Remaining events only feed the audit log.
            _ => Ok(()),
        }
    }

    async fn flush_exchange(&self, key: &(u32, String, String)) -> StoreResult<()> {
        let record = {
            let mut state = self.state.lock().await;
            match state.exchanges.get_mut(key) {
                Some(buf) if !buf.flushed => {
                    buf.flushed = true;
                    Some(DebateExchangeRecord {
                        session_id: self.session_id.clone(),
                        round_number: key.0,
                        debate_type: buf.debate_type,
                        challenger: key.1.clone(),
                        responder: key.2.clone(),
                        challenge_content: buf.challenge.clone(),
                        response_content: buf.response.clone(),
                        followup_content: buf.followup.clone(),
                        revised: buf.revised,
                        created_at: Utc::now(),
                    })
                }
                _ => None,
            }
        };
        match record {
            Some(record) => self.store.insert_debate_exchange(&record).await,
            None => Ok(()),
        }
    }

    async fn take_tool_start(&self, invocation_id: &str) -> Option<ToolStartBuf> {
        self.state.lock().await.tool_starts.remove(invocation_id)
    }

    async fn enqueue_audit_event(&self, event: &WorkflowEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize event for audit");
                return;
            }
        };
        let record = WorkflowEventRecord {
            session_id: self.session_id.clone(),
            event_type: event.event_type().to_string(),
            agent_name: event.agent().map(String::from),
            tool_name: event.tool().map(String::from),
            node_id: None,
            payload,
            created_at: Utc::now(),
        };
        if self.audit_tx.try_send(AuditWrite::Event(record)).is_err() {
            warn!("audit queue full, dropping workflow event");
        }
    }

    async fn enqueue_audit_tool(&self, record: ToolInvocationRecord) {
        if self.audit_tx.try_send(AuditWrite::Tool(record)).is_err() {
            warn!("audit queue full, dropping tool invocation");
        }
    }

    /// Drain the audit queue and stop the worker.
    pub async fn close(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = self.audit_tx.send(AuditWrite::Shutdown).await;
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), worker).await;
        }
    }
}

impl ExchangeBuf {
    fn new(debate_type: DebateType) -> Self {
        Self {
            debate_type,
            challenge: String::new(),
            response: String::new(),
            followup: None,
            revised: false,
            flushed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Profile;
    use crate::store::{MemoryStore, Store};

    async fn sink_with_store(
        enable_followup: bool,
    ) -> (std::sync::Arc<MemoryStore>, SessionEventSink) {
        let store = MemoryStore::shared();
        let session = SessionRecord::new("s-1", Profile::default(), 2, enable_followup, false);
        let sink = SessionEventSink::create(store.clone(), &session)
            .await
            .unwrap();
        (store, sink)
    }

    fn ts() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn test_orchestrator_start_marks_running() {
        let (store, sink) = sink_with_store(true).await;
        sink.apply(&WorkflowEvent::OrchestratorStart {
            session_id: "s-1".to_string(),
            agents: vec![],
            debate_rounds: 0,
            timestamp: ts(),
        })
        .await
        .unwrap();

        let session = store.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.phase, WorkflowPhase::Gather);
        assert!(session.started_at.is_some());
    }

    #[tokio::test]
    async fn test_agent_lifecycle_builds_result_row() {
        let (store, sink) = sink_with_store(true).await;
        sink.apply(&WorkflowEvent::AgentStart {
            agent: "trend_scout".to_string(),
            task: None,
            timestamp: ts(),
        })
        .await
        .unwrap();

        let running = &store.list_agent_results("s-1").await.unwrap()[0];
        assert_eq!(running.status, AgentStatus::Running);

        for piece in ["alpha ", "beta"] {
            sink.apply(&WorkflowEvent::AgentChunk {
                agent: "trend_scout".to_string(),
                content: piece.to_string(),
            })
            .await
            .unwrap();
        }
        sink.apply(&WorkflowEvent::AgentEnd {
            agent: "trend_scout".to_string(),
            status: AgentStatus::Completed,
            duration_ms: 42,
            attempt: 1,
            error: None,
            timestamp: ts(),
        })
        .await
        .unwrap();

        let rows = store.list_agent_results("s-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, AgentStatus::Completed);
        assert_eq!(rows[0].content, "alpha beta");
        assert_eq!(rows[0].duration_ms, Some(42));
    }

    #[tokio::test]
    async fn test_final_output_overrides_chunk_join() {
        let (store, sink) = sink_with_store(true).await;
        sink.apply(&WorkflowEvent::AgentStart {
            agent: "trend_scout".to_string(),
            task: None,
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::AgentChunk {
            agent: "trend_scout".to_string(),
            content: "raw".to_string(),
        })
        .await
        .unwrap();

        sink.set_final_output(
            "trend_scout",
            FinalOutput {
                content: "## Normalized".to_string(),
                thinking: Some("reasoning".to_string()),
                sources: vec!["https://a.example".to_string()],
                confidence: 0.9,
            },
        )
        .await;
        sink.apply(&WorkflowEvent::AgentEnd {
            agent: "trend_scout".to_string(),
            status: AgentStatus::Completed,
            duration_ms: 10,
            attempt: 1,
            error: None,
            timestamp: ts(),
        })
        .await
        .unwrap();

        let rows = store.list_agent_results("s-1").await.unwrap();
        assert_eq!(rows[0].content, "## Normalized");
        assert_eq!(rows[0].sources, vec!["https://a.example".to_string()]);
        assert_eq!(rows[0].confidence, 0.9);
    }

    #[tokio::test]
    async fn test_exchange_flushes_on_followup_end() {
        let (store, sink) = sink_with_store(true).await;
        sink.apply(&WorkflowEvent::DebateRoundStart {
            round_number: 1,
            debate_type: DebateType::PeerReview,
            participants: vec![],
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::AgentChallengeEnd {
            round_number: 1,
            from_agent: "trend_scout".to_string(),
            to_agent: "competitor_analyst".to_string(),
            challenge_content: "challenge".to_string(),
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::AgentRespondEnd {
            round_number: 1,
            from_agent: "competitor_analyst".to_string(),
            to_agent: "trend_scout".to_string(),
            response_content: "response".to_string(),
            revised: true,
            timestamp: ts(),
        })
        .await
        .unwrap();
        // Follow-up enabled: nothing flushed yet.
        assert!(store.list_debate_exchanges("s-1").await.unwrap().is_empty());

        sink.apply(&WorkflowEvent::AgentFollowupEnd {
            round_number: 1,
            from_agent: "trend_scout".to_string(),
            to_agent: "competitor_analyst".to_string(),
            followup_content: "accepted".to_string(),
            timestamp: ts(),
        })
        .await
        .unwrap();

        let rows = store.list_debate_exchanges("s-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].challenger, "trend_scout");
        assert_eq!(rows[0].responder, "competitor_analyst");
        assert_eq!(rows[0].challenge_content, "challenge");
        assert_eq!(rows[0].response_content, "response");
        assert_eq!(rows[0].followup_content.as_deref(), Some("accepted"));
        assert!(rows[0].revised);
    }

    #[tokio::test]
    async fn test_exchange_flushes_on_respond_end_without_followup() {
        let (store, sink) = sink_with_store(false).await;
        sink.apply(&WorkflowEvent::DebateRoundStart {
            round_number: 1,
            debate_type: DebateType::PeerReview,
            participants: vec![],
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::AgentChallengeEnd {
            round_number: 1,
            from_agent: "a".to_string(),
            to_agent: "b".to_string(),
            challenge_content: "c".to_string(),
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::AgentRespondEnd {
            round_number: 1,
            from_agent: "b".to_string(),
            to_agent: "a".to_string(),
            response_content: "r".to_string(),
            revised: false,
            timestamp: ts(),
        })
        .await
        .unwrap();

        assert_eq!(store.list_debate_exchanges("s-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_round_end_flushes_stragglers_once() {
        let (store, sink) = sink_with_store(true).await;
        sink.apply(&WorkflowEvent::DebateRoundStart {
            round_number: 2,
            debate_type: DebateType::RedTeam,
            participants: vec![],
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::AgentChallengeEnd {
            round_number: 2,
            from_agent: "debate_challenger".to_string(),
            to_agent: "trend_scout".to_string(),
            challenge_content: "c".to_string(),
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::AgentRespondEnd {
            round_number: 2,
            from_agent: "trend_scout".to_string(),
            to_agent: "debate_challenger".to_string(),
            response_content: "r".to_string(),
            revised: false,
            timestamp: ts(),
        })
        .await
        .unwrap();

        // Follow-up never arrives (degraded path); round end must flush.
        sink.apply(&WorkflowEvent::DebateRoundEnd {
            round_number: 2,
            exchanges_count: 1,
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::DebateRoundEnd {
            round_number: 2,
            exchanges_count: 1,
            timestamp: ts(),
        })
        .await
        .unwrap();

        let rows = store.list_debate_exchanges("s-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].debate_type, DebateType::RedTeam);
    }

    #[tokio::test]
    async fn test_error_event_fails_session() {
        let (store, sink) = sink_with_store(true).await;
        sink.apply(&WorkflowEvent::Error {
            session_id: Some("s-1".to_string()),
            error: "model quota exhausted".to_string(),
            timestamp: ts(),
        })
        .await
        .unwrap();

        let session = store.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.phase, WorkflowPhase::Error);
        assert_eq!(
            session.error_message.as_deref(),
            Some("model quota exhausted")
        );
    }

    #[tokio::test]
    async fn test_audit_log_receives_non_chunk_events() {
        let (store, sink) = sink_with_store(true).await;
        sink.apply(&WorkflowEvent::OrchestratorStart {
            session_id: "s-1".to_string(),
            agents: vec![],
            debate_rounds: 0,
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::AgentChunk {
            agent: "trend_scout".to_string(),
            content: "never logged".to_string(),
        })
        .await
        .unwrap();
        sink.close().await;

        let events = store.list_workflow_events("s-1", 100).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "orchestrator_start");
    }

    #[tokio::test]
    async fn test_tool_lifecycle_lands_single_row() {
        let (store, sink) = sink_with_store(true).await;
        let input = serde_json::json!({"q": "x"});
        sink.apply(&WorkflowEvent::ToolStart {
            invocation_id: "inv-1".to_string(),
            tool: "web_search".to_string(),
            agent: "trend_scout".to_string(),
            context: Some("gather".to_string()),
            model_name: "m".to_string(),
            cache_hit: false,
            input: input.clone(),
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.apply(&WorkflowEvent::ToolEnd {
            invocation_id: "inv-1".to_string(),
            tool: "web_search".to_string(),
            agent: "trend_scout".to_string(),
            context: Some("gather".to_string()),
            model_name: "m".to_string(),
            cache_hit: false,
            input,
            output: serde_json::json!({"results": []}),
            duration_ms: 12,
            estimated_input_tokens: 3,
            estimated_output_tokens: 1,
            estimated_cost_usd: 0.000_01,
            cost_mode: "estimate".to_string(),
            timestamp: ts(),
        })
        .await
        .unwrap();
        sink.close().await;

        let rows = store.list_tool_invocations("s-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].duration_ms, Some(12));
        assert!(rows[0].started_at.is_some());
    }
}
