//! Postgres-backed store.
//!
//! One connection pool for the whole process; writers coordinate through
//! row-level upserts keyed on business identifiers. Migrations are embedded
//! at compile time and applied on startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::agents::Profile;
use crate::config::StoreConfig;
use crate::events::{AgentStatus, DebateType};

use super::{
    AgentResultRecord, DebateExchangeRecord, SessionRecord, SessionStatus, SessionUpdate, Store,
    StoreError, StoreResult, ToolInvocationRecord, WorkflowEventRecord, WorkflowPhase,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// sqlx-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run migrations.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let url = config
            .connection_url()
            .ok_or_else(|| StoreError::Connection("store parameters incomplete".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .connect(&url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!(pool_size = config.pool_size, "store connected");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn session_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<SessionRecord> {
        let profile: Option<Value> = row.try_get("profile").map_err(query_err)?;
        let profile = profile
            .map(|v| serde_json::from_value::<Profile>(v))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?
            .unwrap_or_default();

        let status: String = row.try_get("status").map_err(query_err)?;
        let phase: String = row.try_get("phase").map_err(query_err)?;

        Ok(SessionRecord {
            id: row.try_get("id").map_err(query_err)?,
            profile,
            debate_rounds: row.try_get::<i32, _>("debate_rounds").map_err(query_err)? as u32,
            enable_followup: row.try_get("enable_followup").map_err(query_err)?,
            enable_websearch: row.try_get("enable_websearch").map_err(query_err)?,
            status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Pending),
            phase: WorkflowPhase::parse(&phase).unwrap_or(WorkflowPhase::Init),
            current_debate_round: row
                .try_get::<i32, _>("current_debate_round")
                .map_err(query_err)? as u32,
            synthesized_report: row.try_get("synthesized_report").map_err(query_err)?,
            report_html_url: row.try_get("report_html_url").map_err(query_err)?,
            evidence_pack: row.try_get("evidence_pack").map_err(query_err)?,
            memory_snapshot: row.try_get("memory_snapshot").map_err(query_err)?,
            error_message: row.try_get("error_message").map_err(query_err)?,
            created_at: row.try_get("created_at").map_err(query_err)?,
            started_at: row.try_get("started_at").map_err(query_err)?,
            completed_at: row.try_get("completed_at").map_err(query_err)?,
        })
    }
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

const SESSION_COLUMNS: &str = "id, target_market, supply_chain, seller_type, min_price, max_price, \
profile, debate_rounds, enable_followup, enable_websearch, status, phase, current_debate_round, \
synthesized_report, report_html_url, evidence_pack, memory_snapshot, error_message, \
created_at, started_at, completed_at";

#[async_trait]
impl Store for PgStore {
    async fn create_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let profile_json = serde_json::to_value(&record.profile)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, target_market, supply_chain, seller_type, min_price, max_price,
                profile, debate_rounds, enable_followup, enable_websearch,
                status, phase, current_debate_round, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.profile.target_market)
        .bind(&record.profile.supply_chain)
        .bind(&record.profile.seller_type)
        .bind(record.profile.min_price)
        .bind(record.profile.max_price)
        .bind(profile_json)
        .bind(record.debate_rounds as i32)
        .bind(record.enable_followup)
        .bind(record.enable_websearch)
        .bind(record.status.as_str())
        .bind(record.phase.as_str())
        .bind(record.current_debate_round as i32)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn update_session(&self, session_id: &str, update: SessionUpdate) -> StoreResult<()> {
        // Monotonicity is enforced in SQL: a terminal status never regresses
        // and the phase only moves forward (error absorbs everything).
        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                status = CASE
                    WHEN $2::text IS NULL THEN status
                    WHEN status IN ('completed','failed','cancelled') THEN status
                    ELSE $2::text
                END,
                phase = CASE
                    WHEN $3::text IS NULL THEN phase
                    WHEN phase IN ('complete','error') THEN phase
                    ELSE $3::text
                END,
                current_debate_round = COALESCE($4, current_debate_round),
                synthesized_report = COALESCE($5, synthesized_report),
                report_html_url = COALESCE($6, report_html_url),
                evidence_pack = COALESCE($7, evidence_pack),
                memory_snapshot = COALESCE($8, memory_snapshot),
                error_message = COALESCE($9, error_message),
                enable_websearch = COALESCE($10, enable_websearch),
                started_at = COALESCE($11, started_at),
                completed_at = COALESCE($12, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .bind(update.status.map(|s| s.as_str().to_string()))
        .bind(update.phase.map(|p| p.as_str().to_string()))
        .bind(update.current_debate_round.map(|r| r as i32))
        .bind(update.synthesized_report)
        .bind(update.report_html_url)
        .bind(update.evidence_pack)
        .bind(update.memory_snapshot)
        .bind(update.error_message)
        .bind(update.enable_websearch)
        .bind(update.started_at)
        .bind(update.completed_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn list_sessions(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<SessionRecord>> {
        let limit = limit.clamp(1, 100);
        let offset = offset.max(0);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY COALESCE(started_at, created_at) DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter().map(Self::session_from_row).collect()
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn upsert_agent_result(&self, record: &AgentResultRecord) -> StoreResult<()> {
        let sources = serde_json::to_value(&record.sources)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO agent_results (
                session_id, agent_name, content, thinking, sources, confidence,
                status, duration_ms, error_message, created_at, completed_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT (session_id, agent_name) DO UPDATE SET
                content = EXCLUDED.content,
                thinking = EXCLUDED.thinking,
                sources = EXCLUDED.sources,
                confidence = EXCLUDED.confidence,
                status = EXCLUDED.status,
                duration_ms = EXCLUDED.duration_ms,
                error_message = EXCLUDED.error_message,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.agent_name)
        .bind(&record.content)
        .bind(&record.thinking)
        .bind(sources)
        .bind(record.confidence)
        .bind(record.status.as_str())
        .bind(record.duration_ms.map(|d| d as i64))
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_agent_results(&self, session_id: &str) -> StoreResult<Vec<AgentResultRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, agent_name, content, thinking, sources, confidence,
                   status, duration_ms, error_message, created_at, completed_at
            FROM agent_results WHERE session_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let sources: Option<Value> = row.try_get("sources").map_err(query_err)?;
                let sources = sources
                    .map(serde_json::from_value::<Vec<String>>)
                    .transpose()
                    .map_err(|e| StoreError::Serialization(e.to_string()))?
                    .unwrap_or_default();
                let status: String = row.try_get("status").map_err(query_err)?;

                Ok(AgentResultRecord {
                    session_id: row.try_get("session_id").map_err(query_err)?,
                    agent_name: row.try_get("agent_name").map_err(query_err)?,
                    content: row
                        .try_get::<Option<String>, _>("content")
                        .map_err(query_err)?
                        .unwrap_or_default(),
                    thinking: row.try_get("thinking").map_err(query_err)?,
                    sources,
                    confidence: row
                        .try_get::<Option<f64>, _>("confidence")
                        .map_err(query_err)?
                        .unwrap_or(1.0),
                    status: parse_agent_status(&status),
                    duration_ms: row
                        .try_get::<Option<i64>, _>("duration_ms")
                        .map_err(query_err)?
                        .map(|d| d.max(0) as u64),
                    error_message: row.try_get("error_message").map_err(query_err)?,
                    created_at: row.try_get("created_at").map_err(query_err)?,
                    completed_at: row.try_get("completed_at").map_err(query_err)?,
                })
            })
            .collect()
    }

    async fn insert_debate_exchange(&self, record: &DebateExchangeRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO debate_exchanges (
                session_id, round_number, debate_type, challenger, responder,
                challenge_content, response_content, followup_content, revised, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(&record.session_id)
        .bind(record.round_number as i32)
        .bind(record.debate_type.as_str())
        .bind(&record.challenger)
        .bind(&record.responder)
        .bind(&record.challenge_content)
        .bind(&record.response_content)
        .bind(&record.followup_content)
        .bind(record.revised)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_debate_exchanges(
        &self,
        session_id: &str,
    ) -> StoreResult<Vec<DebateExchangeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, round_number, debate_type, challenger, responder,
                   challenge_content, response_content, followup_content, revised, created_at
            FROM debate_exchanges WHERE session_id = $1
            ORDER BY round_number ASC, created_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let debate_type: String = row.try_get("debate_type").map_err(query_err)?;
                Ok(DebateExchangeRecord {
                    session_id: row.try_get("session_id").map_err(query_err)?,
                    round_number: row.try_get::<i32, _>("round_number").map_err(query_err)?
                        as u32,
                    debate_type: if debate_type == "red_team" {
                        DebateType::RedTeam
                    } else {
                        DebateType::PeerReview
                    },
                    challenger: row.try_get("challenger").map_err(query_err)?,
                    responder: row.try_get("responder").map_err(query_err)?,
                    challenge_content: row.try_get("challenge_content").map_err(query_err)?,
                    response_content: row.try_get("response_content").map_err(query_err)?,
                    followup_content: row.try_get("followup_content").map_err(query_err)?,
                    revised: row.try_get("revised").map_err(query_err)?,
                    created_at: row.try_get("created_at").map_err(query_err)?,
                })
            })
            .collect()
    }

    async fn insert_workflow_event(&self, record: &WorkflowEventRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_events (session_id, event_type, agent_name, tool_name, node_id, payload, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.event_type)
        .bind(&record.agent_name)
        .bind(&record.tool_name)
        .bind(&record.node_id)
        .bind(&record.payload)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_workflow_events(
        &self,
        session_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowEventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, event_type, agent_name, tool_name, node_id, payload, created_at
            FROM workflow_events WHERE session_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(session_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                Ok(WorkflowEventRecord {
                    session_id: row.try_get("session_id").map_err(query_err)?,
                    event_type: row.try_get("event_type").map_err(query_err)?,
                    agent_name: row.try_get("agent_name").map_err(query_err)?,
                    tool_name: row.try_get("tool_name").map_err(query_err)?,
                    node_id: row.try_get("node_id").map_err(query_err)?,
                    payload: row.try_get("payload").map_err(query_err)?,
                    created_at: row.try_get("created_at").map_err(query_err)?,
                })
            })
            .collect()
    }

    async fn upsert_tool_invocation(&self, record: &ToolInvocationRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tool_invocations (
                invocation_id, session_id, agent_name, tool_name, context, model_name,
                status, cache_hit, input, output, error_message, duration_ms,
                estimated_input_tokens, estimated_output_tokens, estimated_cost_usd,
                started_at, finished_at, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            ON CONFLICT (invocation_id) DO UPDATE SET
                status = EXCLUDED.status,
                cache_hit = EXCLUDED.cache_hit,
                output = EXCLUDED.output,
                error_message = EXCLUDED.error_message,
                duration_ms = EXCLUDED.duration_ms,
                estimated_input_tokens = EXCLUDED.estimated_input_tokens,
                estimated_output_tokens = EXCLUDED.estimated_output_tokens,
                estimated_cost_usd = EXCLUDED.estimated_cost_usd,
                finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(&record.invocation_id)
        .bind(&record.session_id)
        .bind(&record.agent_name)
        .bind(&record.tool_name)
        .bind(&record.context)
        .bind(&record.model_name)
        .bind(&record.status)
        .bind(record.cache_hit)
        .bind(&record.input)
        .bind(&record.output)
        .bind(&record.error_message)
        .bind(record.duration_ms.map(|d| d as i64))
        .bind(record.estimated_input_tokens.map(|t| t as i64))
        .bind(record.estimated_output_tokens.map(|t| t as i64))
        .bind(record.estimated_cost_usd)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_tool_invocations(
        &self,
        session_id: &str,
    ) -> StoreResult<Vec<ToolInvocationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT invocation_id, session_id, agent_name, tool_name, context, model_name,
                   status, cache_hit, input, output, error_message, duration_ms,
                   estimated_input_tokens, estimated_output_tokens, estimated_cost_usd,
                   started_at, finished_at, created_at
            FROM tool_invocations WHERE session_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                Ok(ToolInvocationRecord {
                    invocation_id: row.try_get("invocation_id").map_err(query_err)?,
                    session_id: row.try_get("session_id").map_err(query_err)?,
                    agent_name: row.try_get("agent_name").map_err(query_err)?,
                    tool_name: row.try_get("tool_name").map_err(query_err)?,
                    context: row.try_get("context").map_err(query_err)?,
                    model_name: row.try_get("model_name").map_err(query_err)?,
                    status: row.try_get("status").map_err(query_err)?,
                    cache_hit: row.try_get("cache_hit").map_err(query_err)?,
                    input: row.try_get("input").map_err(query_err)?,
                    output: row.try_get("output").map_err(query_err)?,
                    error_message: row.try_get("error_message").map_err(query_err)?,
                    duration_ms: row
                        .try_get::<Option<i64>, _>("duration_ms")
                        .map_err(query_err)?
                        .map(|d| d.max(0) as u64),
                    estimated_input_tokens: row
                        .try_get::<Option<i64>, _>("estimated_input_tokens")
                        .map_err(query_err)?
                        .map(|t| t.max(0) as u64),
                    estimated_output_tokens: row
                        .try_get::<Option<i64>, _>("estimated_output_tokens")
                        .map_err(query_err)?
                        .map(|t| t.max(0) as u64),
                    estimated_cost_usd: row.try_get("estimated_cost_usd").map_err(query_err)?,
                    started_at: row.try_get("started_at").map_err(query_err)?,
                    finished_at: row.try_get("finished_at").map_err(query_err)?,
                    created_at: row.try_get("created_at").map_err(query_err)?,
                })
            })
            .collect()
    }
}

fn parse_agent_status(value: &str) -> AgentStatus {
    match value {
        "pending" => AgentStatus::Pending,
        "running" => AgentStatus::Running,
        "completed" => AgentStatus::Completed,
        "degraded" => AgentStatus::Degraded,
        "skipped" => AgentStatus::Skipped,
        _ => AgentStatus::Failed,
    }
}

/// Timestamp helper shared by callers building records from events.
pub fn subtract_ms(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    at - chrono::Duration::milliseconds(ms as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_status_fallback() {
        assert_eq!(parse_agent_status("completed"), AgentStatus::Completed);
        assert_eq!(parse_agent_status("degraded"), AgentStatus::Degraded);
        assert_eq!(parse_agent_status("mystery"), AgentStatus::Failed);
    }

    #[test]
    fn test_subtract_ms() {
        let now = Utc::now();
        let earlier = subtract_ms(now, 1500);
        assert_eq!((now - earlier).num_milliseconds(), 1500);
    }
}
