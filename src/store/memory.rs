//! In-memory store.
//!
//! Backs tests and database-less deployments (the service stays useful for
//! live streaming even when no Postgres is configured; only reconnect
//! recovery is lost across restarts). Semantics mirror the Postgres store,
//! including upsert keys and monotonic session transitions.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    AgentResultRecord, DebateExchangeRecord, SessionRecord, SessionUpdate, Store, StoreError,
    StoreResult, ToolInvocationRecord, WorkflowEventRecord,
};

struct SessionState {
    session: SessionRecord,
    agent_results: Vec<AgentResultRecord>,
    debate_exchanges: Vec<DebateExchangeRecord>,
    workflow_events: Vec<WorkflowEventRecord>,
    tool_invocations: Vec<ToolInvocationRecord>,
}

impl SessionState {
    fn new(session: SessionRecord) -> Self {
        Self {
            session,
            agent_results: Vec::new(),
            debate_exchanges: Vec::new(),
            workflow_events: Vec::new(),
            tool_invocations: Vec::new(),
        }
    }
}

/// HashMap-backed [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(record.id.clone())
            .or_insert_with(|| SessionState::new(record.clone()));
        Ok(())
    }

    async fn update_session(&self, session_id: &str, update: SessionUpdate) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let session = &mut state.session;

        if let Some(status) = update.status {
            if session.status.may_transition_to(status) {
                session.status = status;
            }
        }
        if let Some(phase) = update.phase {
            if session.phase.advances_to(phase) {
                session.phase = phase;
            }
        }
        if let Some(round) = update.current_debate_round {
            session.current_debate_round = round;
        }
        if let Some(report) = update.synthesized_report {
            session.synthesized_report = Some(report);
        }
        if let Some(url) = update.report_html_url {
            session.report_html_url = Some(url);
        }
        if let Some(pack) = update.evidence_pack {
            session.evidence_pack = Some(pack);
        }
        if let Some(snapshot) = update.memory_snapshot {
            session.memory_snapshot = Some(snapshot);
        }
        if let Some(message) = update.error_message {
            session.error_message = Some(message);
        }
        if let Some(enabled) = update.enable_websearch {
            session.enable_websearch = enabled;
        }
        if let Some(at) = update.started_at {
            session.started_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            session.completed_at = Some(at);
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).map(|s| s.session.clone()))
    }

    async fn list_sessions(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<SessionRecord>> {
        let sessions = self.sessions.read().await;
        let mut rows: Vec<SessionRecord> = sessions
            .values()
            .map(|s| s.session.clone())
            .filter(|s| status.map_or(true, |wanted| s.status.as_str() == wanted))
            .collect();
        rows.sort_by(|a, b| {
            let a_key = a.started_at.unwrap_or(a.created_at);
            let b_key = b.started_at.unwrap_or(b.created_at);
            b_key.cmp(&a_key)
        });
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.clamp(1, 100) as usize)
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn upsert_agent_result(&self, record: &AgentResultRecord) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(&record.session_id)
            .ok_or_else(|| StoreError::SessionNotFound(record.session_id.clone()))?;

        match state
            .agent_results
            .iter_mut()
            .find(|r| r.agent_name == record.agent_name)
        {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = record.clone();
                existing.created_at = created_at;
            }
            None => state.agent_results.push(record.clone()),
        }
        Ok(())
    }

    async fn list_agent_results(&self, session_id: &str) -> StoreResult<Vec<AgentResultRecord>> {
        let sessions = self.sessions.read().await;
        let mut rows = sessions
            .get(session_id)
            .map(|s| s.agent_results.clone())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn insert_debate_exchange(&self, record: &DebateExchangeRecord) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(&record.session_id)
            .ok_or_else(|| StoreError::SessionNotFound(record.session_id.clone()))?;
        state.debate_exchanges.push(record.clone());
        Ok(())
    }

    async fn list_debate_exchanges(
        &self,
        session_id: &str,
    ) -> StoreResult<Vec<DebateExchangeRecord>> {
        let sessions = self.sessions.read().await;
        let mut rows = sessions
            .get(session_id)
            .map(|s| s.debate_exchanges.clone())
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            a.round_number
                .cmp(&b.round_number)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(rows)
    }

    async fn insert_workflow_event(&self, record: &WorkflowEventRecord) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(&record.session_id)
            .ok_or_else(|| StoreError::SessionNotFound(record.session_id.clone()))?;
        state.workflow_events.push(record.clone());
        Ok(())
    }

    async fn list_workflow_events(
        &self,
        session_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowEventRecord>> {
        let sessions = self.sessions.read().await;
        let rows = sessions
            .get(session_id)
            .map(|s| s.workflow_events.clone())
            .unwrap_or_default();
        Ok(rows.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn upsert_tool_invocation(&self, record: &ToolInvocationRecord) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(&record.session_id)
            .ok_or_else(|| StoreError::SessionNotFound(record.session_id.clone()))?;

        match state
            .tool_invocations
            .iter_mut()
            .find(|r| r.invocation_id == record.invocation_id)
        {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = record.clone();
                existing.created_at = created_at;
            }
            None => state.tool_invocations.push(record.clone()),
        }
        Ok(())
    }

    async fn list_tool_invocations(
        &self,
        session_id: &str,
    ) -> StoreResult<Vec<ToolInvocationRecord>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .map(|s| s.tool_invocations.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Profile;
    use crate::events::{AgentStatus, DebateType};
    use chrono::Utc;

    fn session(id: &str) -> SessionRecord {
        SessionRecord::new(id, Profile::default(), 2, true, false)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryStore::new();
        let mut record = session("s-1");
        store.create_session(&record).await.unwrap();

        record.debate_rounds = 99;
        store.create_session(&record).await.unwrap();

        let stored = store.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(stored.debate_rounds, 2);
    }

    #[tokio::test]
    async fn test_update_respects_monotonic_status() {
        let store = MemoryStore::new();
        store.create_session(&session("s-1")).await.unwrap();

        store
            .update_session(
                "s-1",
                SessionUpdate {
                    status: Some(super::super::SessionStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_session(
                "s-1",
                SessionUpdate {
                    status: Some(super::super::SessionStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stored = store.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(stored.status, super::super::SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_agent_result_upsert_by_key() {
        let store = MemoryStore::new();
        store.create_session(&session("s-1")).await.unwrap();

        let mut result = AgentResultRecord::started("s-1", "trend_scout");
        store.upsert_agent_result(&result).await.unwrap();

        result.status = AgentStatus::Completed;
        result.content = "final".to_string();
        store.upsert_agent_result(&result).await.unwrap();

        let rows = store.list_agent_results("s-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, AgentStatus::Completed);
        assert_eq!(rows[0].content, "final");
    }

    #[tokio::test]
    async fn test_tool_invocation_idempotent_by_id() {
        let store = MemoryStore::new();
        store.create_session(&session("s-1")).await.unwrap();

        let mut record = ToolInvocationRecord::pending("s-1", "inv-1", "web_search", None);
        store.upsert_tool_invocation(&record).await.unwrap();
        record.status = "completed".to_string();
        store.upsert_tool_invocation(&record).await.unwrap();

        let rows = store.list_tool_invocations("s-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
    }

    #[tokio::test]
    async fn test_debate_exchanges_ordered() {
        let store = MemoryStore::new();
        store.create_session(&session("s-1")).await.unwrap();

        for round in [2u32, 1, 1] {
            store
                .insert_debate_exchange(&DebateExchangeRecord {
                    session_id: "s-1".to_string(),
                    round_number: round,
                    debate_type: if round == 1 {
                        DebateType::PeerReview
                    } else {
                        DebateType::RedTeam
                    },
                    challenger: "a".to_string(),
                    responder: "b".to_string(),
                    challenge_content: String::new(),
                    response_content: String::new(),
                    followup_content: None,
                    revised: false,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let rows = store.list_debate_exchanges("s-1").await.unwrap();
        let rounds: Vec<u32> = rows.iter().map(|r| r.round_number).collect();
        assert_eq!(rounds, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = MemoryStore::new();
        store.create_session(&session("s-1")).await.unwrap();
        store
            .upsert_agent_result(&AgentResultRecord::started("s-1", "trend_scout"))
            .await
            .unwrap();

        store.delete_session("s-1").await.unwrap();
        assert!(store.get_session("s-1").await.unwrap().is_none());
        assert!(store.list_agent_results("s-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_sessions_filter_and_paging() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.create_session(&session(&format!("s-{i}"))).await.unwrap();
        }
        let all = store.list_sessions(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 5);

        let paged = store.list_sessions(None, 2, 2).await.unwrap();
        assert_eq!(paged.len(), 2);

        let filtered = store.list_sessions(Some("running"), 10, 0).await.unwrap();
        assert!(filtered.is_empty());
    }
}
