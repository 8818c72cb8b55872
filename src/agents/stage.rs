//! Agent stage execution.
//!
//! One stage = prompt assembly, a streaming model call, event emission for
//! every increment, and result normalization. The gather workers get their
//! full lifecycle here (retry loop included); the debate coordinator and
//! the synthesizer reuse the single-attempt [`stream_call`] and drive their
//! own lifecycles.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tracing::{error, info, warn};

use crate::agents::extract::{normalize_report, split_sentinels, ToolMarkerFilter, THINKING_ENDS, REPORT_STARTS};
use crate::agents::{prompts, AgentContext, AgentName};
use crate::config::AppConfig;
use crate::engine::{CancelToken, EventPipe};
use crate::events::{AgentStatus, WorkflowEvent};
use crate::llm::{ChatModel, ChatRequest, LlmError, StreamChunk};
use crate::policy::{DegradeMode, RetryPolicy};
use crate::store::sink::FinalOutput;
use crate::store::{AgentResultRecord, StoreError};
use crate::tools::ToolRegistry;

/// Error type for stage execution.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("model error: {0}")]
    Llm(#[from] LlmError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("stage deadline exceeded")]
    Deadline,

    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for stage execution.
pub type StageResult<T> = Result<T, StageError>;

/// Everything a stage needs from its surroundings. Cloned into each
/// spawned worker.
#[derive(Clone)]
pub struct StageServices {
    pub config: Arc<AppConfig>,
    pub model: Option<Arc<dyn ChatModel>>,
    pub registry: Arc<ToolRegistry>,
    pub pipe: EventPipe,
    pub cancel: CancelToken,
}

/// Whether streaming increments are surfaced as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    Emit,
    Silent,
}

/// Accumulated output of one model call.
#[derive(Debug, Clone, Default)]
pub struct CallOutput {
    pub content: String,
    pub thinking: Option<String>,
    pub sources: Vec<String>,
}

/// Terminal outcome of one gather worker.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub agent: AgentName,
    pub record: AgentResultRecord,
    /// Set when degrade_mode=fail consumed the failure; the engine must
    /// abort the session.
    pub fatal: bool,
    pub cancelled: bool,
}

/// Run one gather worker to a terminal state: events, retries, degrade.
#[allow(clippy::too_many_arguments)]
pub async fn run_worker(
    services: &StageServices,
    agent: AgentName,
    ctx: &AgentContext,
    retry: RetryPolicy,
    degrade: DegradeMode,
    enable_websearch: bool,
    stagger_ms: u64,
) -> StageResult<StageOutcome> {
    let started = Instant::now();

    // Stagger first requests so four workers do not fire simultaneously.
    if stagger_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(stagger_ms)).await;
    }

    services
        .pipe
        .emit(WorkflowEvent::AgentStart {
            agent: agent.as_str().to_string(),
            task: Some(agent.description().to_string()),
            timestamp: Utc::now(),
        })
        .await?;

    let system = prompts::system_prompt(agent);
    let user = prompts::gather_user_prompt(agent, ctx);
    let mut last_error = String::new();

    for attempt in 1..=retry.max_attempts {
        if services.cancel.is_cancelled() {
            return finish_cancelled(services, agent, started, attempt).await;
        }

        let call = stream_call(
            services,
            agent,
            &system,
            &user,
            enable_websearch,
            ChunkMode::Emit,
            "gather",
        )
        .await;

        match call {
            Ok(output) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let content = normalize_report(&output.content, agent.display_name());

                services
                    .pipe
                    .sink
                    .set_final_output(
                        agent.as_str(),
                        FinalOutput {
                            content: content.clone(),
                            thinking: output.thinking.clone(),
                            sources: output.sources.clone(),
                            confidence: 1.0,
                        },
                    )
                    .await;

                services
                    .pipe
                    .emit(WorkflowEvent::AgentEnd {
                        agent: agent.as_str().to_string(),
                        status: AgentStatus::Completed,
                        duration_ms,
                        attempt,
                        error: None,
                        timestamp: Utc::now(),
                    })
                    .await?;

                info!(agent = %agent, duration_ms, attempt, "agent completed");

                let mut record = AgentResultRecord::started(&ctx.session_id, agent.as_str());
                record.content = content;
                record.thinking = output.thinking;
                record.sources = output.sources;
                record.status = AgentStatus::Completed;
                record.duration_ms = Some(duration_ms);
                record.completed_at = Some(Utc::now());

                return Ok(StageOutcome {
                    agent,
                    record,
                    fatal: false,
                    cancelled: false,
                });
            }
            Err(StageError::Cancelled) => {
                return finish_cancelled(services, agent, started, attempt).await;
            }
            Err(e) => {
                last_error = e.to_string();
                if retry.should_retry(attempt) {
                    let backoff_ms = retry.backoff_for(attempt, agent.as_str());
                    services
                        .pipe
                        .emit(WorkflowEvent::Retry {
                            target_type: "agent".to_string(),
                            target_id: agent.as_str().to_string(),
                            attempt,
                            max_attempts: retry.max_attempts,
                            error: last_error.clone(),
                            backoff_ms,
                            timestamp: Utc::now(),
                        })
                        .await?;
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    continue;
                }
            }
        }
    }

    // Retries exhausted; degrade.
    let duration_ms = started.elapsed().as_millis() as u64;
    error!(agent = %agent, error = %last_error, "agent failed after retries");

    services
        .pipe
        .emit(WorkflowEvent::AgentError {
            agent: agent.as_str().to_string(),
            error: last_error.clone(),
            duration_ms: Some(duration_ms),
            timestamp: Utc::now(),
        })
        .await?;

    let status = match degrade {
        DegradeMode::Partial => AgentStatus::Degraded,
        DegradeMode::Skip => AgentStatus::Skipped,
        DegradeMode::Fail => AgentStatus::Failed,
    };

    services
        .pipe
        .emit(WorkflowEvent::AgentEnd {
            agent: agent.as_str().to_string(),
            status,
            duration_ms,
            attempt: retry.max_attempts,
            error: Some(last_error.clone()),
            timestamp: Utc::now(),
        })
        .await?;

    let mut record = AgentResultRecord::started(&ctx.session_id, agent.as_str());
    record.status = status;
    record.duration_ms = Some(duration_ms);
    record.error_message = Some(last_error);
    record.completed_at = Some(Utc::now());

    Ok(StageOutcome {
        agent,
        record,
        fatal: degrade == DegradeMode::Fail,
        cancelled: false,
    })
}

async fn finish_cancelled(
    services: &StageServices,
    agent: AgentName,
    started: Instant,
    attempt: u32,
) -> StageResult<StageOutcome> {
    let duration_ms = started.elapsed().as_millis() as u64;
    warn!(agent = %agent, "agent cancelled");

    services
        .pipe
        .emit(WorkflowEvent::AgentEnd {
            agent: agent.as_str().to_string(),
            status: AgentStatus::Failed,
            duration_ms,
            attempt,
            error: Some("cancelled".to_string()),
            timestamp: Utc::now(),
        })
        .await?;

    let mut record = AgentResultRecord::started(services.pipe.sink.session_id(), agent.as_str());
    record.status = AgentStatus::Failed;
    record.duration_ms = Some(duration_ms);
    record.error_message = Some("cancelled".to_string());
    record.completed_at = Some(Utc::now());

    Ok(StageOutcome {
        agent,
        record,
        fatal: false,
        cancelled: true,
    })
}

/// One model call with streaming consumption, tool mediation, and content
/// extraction. No retry; callers own their loops.
pub async fn stream_call(
    services: &StageServices,
    agent: AgentName,
    system_prompt: &str,
    user_prompt: &str,
    enable_websearch: bool,
    chunk_mode: ChunkMode,
    context_label: &str,
) -> StageResult<CallOutput> {
    let model = match &services.model {
        Some(model) => Arc::clone(model),
        None => return placeholder_output(services, agent, chunk_mode).await,
    };

    let websearch_spec = services.config.agent_websearch(agent);
    let use_websearch = websearch_spec.enabled
        && services
            .registry
            .should_enable_websearch(enable_websearch)
            .await;

    let request = ChatRequest::new(&services.config.agent_model(agent), system_prompt, user_prompt)
        .with_websearch(use_websearch, websearch_spec.limit)
        .with_thinking(services.config.agent_thinking_mode(agent));
    let model_name = request.model.clone();

    let deadline = std::time::Duration::from_secs(services.config.limits.stage_deadline_secs);
    let consume = consume_stream(
        services,
        agent,
        model,
        request,
        &model_name,
        chunk_mode,
        context_label,
    );

    match tokio::time::timeout(deadline, consume).await {
        Ok(result) => result,
        Err(_) => Err(StageError::Deadline),
    }
}

async fn consume_stream(
    services: &StageServices,
    agent: AgentName,
    model: Arc<dyn ChatModel>,
    request: ChatRequest,
    model_name: &str,
    chunk_mode: ChunkMode,
    context_label: &str,
) -> StageResult<CallOutput> {
    let mut stream = model.stream_chat(request).await?;

    let mut content_parts: Vec<String> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut sources: Vec<String> = Vec::new();
    let mut filter = ToolMarkerFilter::new();
    let mut open_invocation: Option<String> = None;

    while let Some(item) = stream.next().await {
        if services.cancel.is_cancelled() {
            if let Some(invocation_id) = open_invocation.take() {
                let events = services
                    .registry
                    .error_invocation(&invocation_id, "cancelled")
                    .await;
                services.pipe.emit_all(events).await?;
            }
            return Err(StageError::Cancelled);
        }

        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                if let Some(invocation_id) = open_invocation.take() {
                    let events = services
                        .registry
                        .error_invocation(&invocation_id, &e.to_string())
                        .await;
                    services.pipe.emit_all(events).await?;
                }
                return Err(e.into());
            }
        };

        match chunk {
            StreamChunk::OutputDelta(delta) => {
                let visible = filter.feed(&delta);
                if !visible.is_empty() {
                    if chunk_mode == ChunkMode::Emit {
                        services
                            .pipe
                            .emit(WorkflowEvent::AgentChunk {
                                agent: agent.as_str().to_string(),
                                content: visible.clone(),
                            })
                            .await?;
                    }
                    content_parts.push(visible);
                }
            }
            StreamChunk::ThinkingDelta(delta) => {
                if chunk_mode == ChunkMode::Emit {
                    services
                        .pipe
                        .emit(WorkflowEvent::AgentThinkingChunk {
                            agent: agent.as_str().to_string(),
                            content: delta.clone(),
                        })
                        .await?;
                }
                thinking_parts.push(delta);
            }
            StreamChunk::SearchStarted => {
                let (invocation_id, event) = services
                    .registry
                    .begin_invocation(
                        "web_search",
                        agent.as_str(),
                        Some(context_label),
                        model_name,
                        json!({}),
                        false,
                    )
                    .await;
                open_invocation = Some(invocation_id);
                services.pipe.emit(event).await?;
            }
            StreamChunk::SearchCompleted { sources: found } => {
                for source in &found {
                    if !sources.contains(source) {
                        sources.push(source.clone());
                    }
                }
                if let Some(invocation_id) = open_invocation.take() {
                    let events = services
                        .registry
                        .end_invocation(
                            &invocation_id,
                            json!({"sources": found, "sources_count": found.len()}),
                        )
                        .await;
                    services.pipe.emit_all(events).await?;
                }
            }
        }
    }

    let tail = filter.finish();
    if !tail.is_empty() {
        if chunk_mode == ChunkMode::Emit {
            services
                .pipe
                .emit(WorkflowEvent::AgentChunk {
                    agent: agent.as_str().to_string(),
                    content: tail.clone(),
                })
                .await?;
        }
        content_parts.push(tail);
    }

    // A search left open by a provider that never reported completion is
    // recorded as failed rather than leaked.
    if let Some(invocation_id) = open_invocation.take() {
        let events = services
            .registry
            .error_invocation(&invocation_id, "stream closed before search completed")
            .await;
        services.pipe.emit_all(events).await?;
    }

    let raw_output = content_parts.concat();
    let mut thinking = thinking_parts.concat();

    // Some models put everything on the output channel and partition it
    // with the sentinels instead.
    let content = if raw_output.contains(THINKING_ENDS) || raw_output.contains(REPORT_STARTS) {
        let extracted = split_sentinels(&raw_output);
        if !extracted.thinking.is_empty() {
            if !thinking.is_empty() {
                thinking.push('\n');
            }
            thinking.push_str(&extracted.thinking);
        }
        extracted.report
    } else {
        raw_output
    };

    Ok(CallOutput {
        content,
        thinking: if thinking.is_empty() {
            None
        } else {
            Some(thinking)
        },
        sources,
    })
}

/// Deterministic output used when no provider is configured. Keeps demo
/// runs and tests hermetic.
async fn placeholder_output(
    services: &StageServices,
    agent: AgentName,
    chunk_mode: ChunkMode,
) -> StageResult<CallOutput> {
    let session = services.pipe.sink.session_id().to_string();
    let content = format!(
        "## {}\n\nPlaceholder analysis for session {} (no model provider configured).",
        agent.display_name(),
        session
    );
    if chunk_mode == ChunkMode::Emit {
        services
            .pipe
            .emit(WorkflowEvent::AgentChunk {
                agent: agent.as_str().to_string(),
                content: content.clone(),
            })
            .await?;
    }
    Ok(CallOutput {
        content,
        thinking: None,
        sources: Vec::new(),
    })
}

/// First-request stagger per worker index.
pub fn worker_stagger_ms(agent: AgentName) -> u64 {
    crate::agents::WORKER_AGENTS
        .iter()
        .position(|a| *a == agent)
        .map(|idx| idx as u64 * 120)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_stagger() {
        assert_eq!(worker_stagger_ms(AgentName::TrendScout), 0);
        assert_eq!(worker_stagger_ms(AgentName::CompetitorAnalyst), 120);
        assert_eq!(worker_stagger_ms(AgentName::SocialSentinel), 360);
        assert_eq!(worker_stagger_ms(AgentName::Synthesizer), 0);
    }

    #[test]
    fn test_stage_error_cancelled() {
        assert!(StageError::Cancelled.is_cancelled());
        assert!(!StageError::Deadline.is_cancelled());
    }
}
