//! HTTP/SSE front.
//!
//! Two ways in: the SSE stream endpoint for live UIs and the synchronous
//! generate endpoint; plus status/list/export read endpoints backed by the
//! store, which is how a disconnected client recovers. A client dropping
//! its SSE connection never cancels the run — the engine task owns its own
//! lifetime and keeps writing through the sink.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::Profile;
use crate::engine::{cancel_channel, GraphEngine, RunConfig};
use crate::events::{EventBus, WorkflowEvent};
use crate::policy::{DegradeMode, RetryPolicy};
use crate::store::SessionRecord;
use crate::tools::aggregate_tool_metrics;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GraphEngine>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v2/market-insight/health", get(api_health))
        .route("/api/v2/market-insight/stream", post(stream_insight))
        .route("/api/v2/market-insight/generate", post(generate_insight))
        .route("/api/v2/market-insight/status/{session_id}", get(status))
        .route("/api/v2/market-insight/sessions", get(list_sessions))
        .route("/api/v2/market-insight/export/{file}", get(export_bundle))
        .with_state(state)
}

// ============================================================
// Request / response shapes
// ============================================================

fn default_debate_rounds() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_backoff_ms() -> u64 {
    300
}
fn default_degrade() -> String {
    "partial".to_string()
}

/// Body of the stream and generate endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketInsightRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default = "default_debate_rounds")]
    pub debate_rounds: u32,
    #[serde(default = "default_true")]
    pub enable_followup: bool,
    #[serde(default)]
    pub enable_websearch: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_degrade")]
    pub degrade_mode: String,
}

impl MarketInsightRequest {
    /// Resolve into a run config, generating a session id when absent.
    pub fn into_run_config(self) -> RunConfig {
        RunConfig {
            session_id: self
                .session_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            profile: self.profile.unwrap_or_default(),
            debate_rounds: self.debate_rounds,
            enable_followup: self.enable_followup,
            enable_websearch: self.enable_websearch,
            retry: RetryPolicy::new(self.retry_max_attempts, self.retry_backoff_ms),
            degrade: DegradeMode::parse_or_default(&self.degrade_mode),
        }
        .normalized()
    }
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    session_id: String,
    status: String,
    report: String,
    agent_results: Vec<Value>,
    debate_summary: Value,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

// ============================================================
// Handlers
// ============================================================

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "version": env!("CARGO_PKG_VERSION")}))
}

async fn api_health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "features": {"multi_agent": true, "debate": true, "streaming": true},
    }))
}

/// SSE stream: start (or resume) a run and push every event as
/// `data: {json}`. The run is spawned detached; disconnects only stop the
/// emitter.
async fn stream_insight(
    State(state): State<AppState>,
    Json(request): Json<MarketInsightRequest>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let run = request.into_run_config();
    let session_id = run.session_id.clone();
    info!(session_id = %session_id, "stream run starting");

    let bus = EventBus::new().shared();
    let rx = bus.subscribe();
    let (_cancel_handle, cancel_token) = cancel_channel();

    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run(run, bus, cancel_token).await {
            warn!(session_id = %session_id, error = %e, "run failed to start");
        }
    });

    Sse::new(event_stream(rx)).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(10))
            .text("keep-alive"),
    )
}

/// Convert a bus subscription into the SSE frame stream, closing after the
/// terminal event.
fn event_stream(
    rx: broadcast::Receiver<WorkflowEvent>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    futures::stream::unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = matches!(
                        event,
                        WorkflowEvent::OrchestratorEnd { .. } | WorkflowEvent::Error { .. }
                    );
                    let data = match serde_json::to_string(&event) {
                        Ok(data) => data,
                        Err(_) => continue,
                    };
                    return Some((Ok(SseEvent::default().data(data)), (rx, terminal)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE subscriber lagged; client should resync via status");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Synchronous variant: run to terminal, answer with the stored outcome.
async fn generate_insight(
    State(state): State<AppState>,
    Json(request): Json<MarketInsightRequest>,
) -> Result<Json<GenerateResponse>, (StatusCode, Json<Value>)> {
    let run = request.into_run_config();
    let session_id = run.session_id.clone();

    let bus = EventBus::new().shared();
    let (_cancel_handle, cancel_token) = cancel_channel();
    let status = state
        .engine
        .run(run, bus, cancel_token)
        .await
        .map_err(internal_error)?;

    let store = state.engine.store();
    let session = store
        .get_session(&session_id)
        .await
        .map_err(internal_error)?;
    let agent_results = store
        .list_agent_results(&session_id)
        .await
        .map_err(internal_error)?;
    let exchanges = store
        .list_debate_exchanges(&session_id)
        .await
        .map_err(internal_error)?;

    let rounds = exchanges.iter().map(|e| e.round_number).max().unwrap_or(0);
    Ok(Json(GenerateResponse {
        session_id,
        status: status.as_str().to_string(),
        report: session
            .and_then(|s| s.synthesized_report)
            .unwrap_or_default(),
        agent_results: agent_results
            .iter()
            .map(|r| {
                json!({
                    "agent_name": r.agent_name,
                    "status": r.status,
                    "content": r.content,
                    "sources": r.sources,
                    "duration_ms": r.duration_ms,
                })
            })
            .collect(),
        debate_summary: json!({
            "total_exchanges": exchanges.len(),
            "rounds": rounds,
        }),
        created_at: chrono::Utc::now().to_rfc3339(),
    }))
}

/// Reconnect/recovery: the full stored picture of a session.
async fn status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let store = state.engine.store();

    let session = match store.get_session(&session_id).await.map_err(internal_error)? {
        Some(session) => session,
        None => {
            return Ok(Json(json!({
                "session_id": session_id,
                "status": "not_found",
            })))
        }
    };

    let agent_results = store
        .list_agent_results(&session_id)
        .await
        .map_err(internal_error)?;
    let debate_exchanges = store
        .list_debate_exchanges(&session_id)
        .await
        .map_err(internal_error)?;
    let workflow_events = store
        .list_workflow_events(&session_id, 200)
        .await
        .map_err(internal_error)?;
    let tool_invocations = store
        .list_tool_invocations(&session_id)
        .await
        .map_err(internal_error)?;

    let tool_metrics = aggregate_tool_metrics(&tool_invocations);
    let demo_metrics = demo_metrics(&session, &agent_results);
    let report_html_url = session.report_html_url.clone();

    Ok(Json(json!({
        "session": session,
        "agent_results": agent_results,
        "debate_exchanges": debate_exchanges,
        "workflow_events": workflow_events,
        "tool_invocations": tool_invocations,
        "tool_metrics": tool_metrics,
        "demo_metrics": demo_metrics,
        "report_charts": Value::Null,
        "report_html_url": report_html_url,
    })))
}

/// Paginated session list with report previews.
async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let sessions = state
        .engine
        .store()
        .list_sessions(
            query.status.as_deref(),
            query.limit.unwrap_or(20),
            query.offset.unwrap_or(0),
        )
        .await
        .map_err(internal_error)?;

    let rows: Vec<Value> = sessions
        .iter()
        .map(|s| {
            let preview: String = s
                .synthesized_report
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(260)
                .collect();
            json!({
                "id": s.id,
                "status": s.status,
                "phase": s.phase,
                "current_debate_round": s.current_debate_round,
                "profile": s.profile,
                "debate_rounds": s.debate_rounds,
                "enable_followup": s.enable_followup,
                "enable_websearch": s.enable_websearch,
                "error_message": s.error_message,
                "created_at": s.created_at,
                "started_at": s.started_at,
                "completed_at": s.completed_at,
                "report_preview": preview,
                "has_report": s
                    .synthesized_report
                    .as_deref()
                    .map(|r| !r.is_empty())
                    .unwrap_or(false),
            })
        })
        .collect();

    Ok(Json(json!({"sessions": rows, "count": rows.len()})))
}

/// Artifact bundle download. The HTML/PDF renderer and roadshow packager
/// are external services; this serves the raw stored artifacts.
async fn export_bundle(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let session_id = file.strip_suffix(".zip").unwrap_or(&file).to_string();

    let session = state
        .engine
        .store()
        .get_session(&session_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({"session_id": session_id, "status": "not_found"})),
            )
        })?;

    if session.synthesized_report.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "session_id": session.id,
                "status": "no_artifacts",
                "message": "the session has not produced a report yet",
            })),
        ));
    }

    let bundle = json!({
        "session_id": session.id,
        "profile": session.profile,
        "report_markdown": session.synthesized_report,
        "evidence_pack": session.evidence_pack,
        "memory_snapshot": session.memory_snapshot,
        "exported_at": chrono::Utc::now().to_rfc3339(),
    });
    let body = serde_json::to_vec_pretty(&bundle).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.bundle.json\"", session.id),
            ),
        ],
        body,
    ))
}

// ============================================================
// Helpers
// ============================================================

fn internal_error<E: std::fmt::Display>(e: E) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

/// Light quality metrics for the UI: completion, stability, and evidence
/// coverage.
fn demo_metrics(session: &SessionRecord, agent_results: &[crate::store::AgentResultRecord]) -> Value {
    let workers: Vec<_> = agent_results
        .iter()
        .filter(|r| r.agent_name != "synthesizer")
        .collect();
    let total_agents = workers.len();
    let completed_agents = workers
        .iter()
        .filter(|r| r.status == crate::events::AgentStatus::Completed)
        .count();
    let stability_score = if total_agents == 0 {
        0.0
    } else {
        completed_agents as f64 * 100.0 / total_agents as f64
    };

    let evidence_coverage_rate = session
        .evidence_pack
        .as_ref()
        .and_then(|pack| pack.get("claims"))
        .and_then(Value::as_array)
        .map(|claims| {
            if claims.is_empty() {
                return 0.0;
            }
            let covered = claims
                .iter()
                .filter(|claim| {
                    claim
                        .get("source_agents")
                        .and_then(Value::as_array)
                        .map(|agents| !agents.is_empty())
                        .unwrap_or(false)
                })
                .count();
            covered as f64 / claims.len() as f64
        })
        .unwrap_or(0.0);

    json!({
        "total_agents": total_agents,
        "completed_agents": completed_agents,
        "stability_score": (stability_score * 100.0).round() / 100.0,
        "evidence_coverage_rate": (evidence_coverage_rate * 10_000.0).round() / 10_000.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: MarketInsightRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.debate_rounds, 2);
        assert!(request.enable_followup);
        assert!(!request.enable_websearch);
        assert_eq!(request.retry_max_attempts, 2);
        assert_eq!(request.retry_backoff_ms, 300);
        assert_eq!(request.degrade_mode, "partial");
    }

    #[test]
    fn test_request_generates_session_id() {
        let request: MarketInsightRequest = serde_json::from_str("{}").unwrap();
        let run = request.into_run_config();
        assert!(!run.session_id.is_empty());

        let request: MarketInsightRequest =
            serde_json::from_str(r#"{"session_id": "fixed-id"}"#).unwrap();
        assert_eq!(request.into_run_config().session_id, "fixed-id");
    }

    #[test]
    fn test_request_clamps_rounds() {
        let request: MarketInsightRequest =
            serde_json::from_str(r#"{"debate_rounds": 7}"#).unwrap();
        assert_eq!(request.into_run_config().debate_rounds, 2);
    }

    #[test]
    fn test_request_parses_profile() {
        let request: MarketInsightRequest = serde_json::from_str(
            r#"{
                "profile": {
                    "target_market": "Germany",
                    "supply_chain": "Consumer Electronics",
                    "seller_type": "brand",
                    "min_price": 30,
                    "max_price": 90
                },
                "debate_rounds": 0,
                "degrade_mode": "fail"
            }"#,
        )
        .unwrap();
        let run = request.into_run_config();
        assert_eq!(run.profile.target_market, "Germany");
        assert_eq!(run.debate_rounds, 0);
        assert_eq!(run.degrade, DegradeMode::Fail);
    }

    #[test]
    fn test_demo_metrics_counts_workers_only() {
        let mut session = SessionRecord::new("s", Profile::default(), 0, true, false);
        session.evidence_pack = Some(json!({
            "claims": [
                {"source_agents": ["trend_scout"]},
                {"source_agents": []},
            ]
        }));

        let mut ok = crate::store::AgentResultRecord::started("s", "trend_scout");
        ok.status = crate::events::AgentStatus::Completed;
        let mut synth = crate::store::AgentResultRecord::started("s", "synthesizer");
        synth.status = crate::events::AgentStatus::Completed;
        let bad = crate::store::AgentResultRecord::started("s", "social_sentinel");

        let metrics = demo_metrics(&session, &[ok, synth, bad]);
        assert_eq!(metrics["total_agents"], 2);
        assert_eq!(metrics["completed_agents"], 1);
        assert_eq!(metrics["stability_score"], 50.0);
        assert_eq!(metrics["evidence_coverage_rate"], 0.5);
    }
}
