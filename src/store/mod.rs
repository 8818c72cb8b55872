//! Persistence records and the store abstraction.
//!
//! Rows are keyed by stable business identifiers so writes stay idempotent
//! under retry: sessions by id, agent results by (session, agent), tool
//! invocations by invocation id. Two implementations exist: Postgres for
//! deployments and an in-memory store for tests and database-less runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::Profile;
use crate::events::{AgentStatus, DebateType};

pub mod memory;
pub mod postgres;
pub mod sink;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use sink::SessionEventSink;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Session lifecycle status. Transitions are monotonic: once terminal, a
/// session never moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving to `next` respects monotonicity.
    pub fn may_transition_to(&self, next: SessionStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Pending => true,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Workflow phase; only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Init,
    Gather,
    DebatePeer,
    DebateRedteam,
    Synthesize,
    Complete,
    Error,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Gather => "gather",
            Self::DebatePeer => "debate_peer",
            Self::DebateRedteam => "debate_redteam",
            Self::Synthesize => "synthesize",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "init" => Some(Self::Init),
            "gather" => Some(Self::Gather),
            "debate_peer" => Some(Self::DebatePeer),
            "debate_redteam" => Some(Self::DebateRedteam),
            "synthesize" => Some(Self::Synthesize),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Gather => 1,
            Self::DebatePeer => 2,
            Self::DebateRedteam => 3,
            Self::Synthesize => 4,
            Self::Complete => 5,
            // Error is reachable from anywhere and absorbs.
            Self::Error => 6,
        }
    }

    /// Whether moving to `next` is a forward step.
    pub fn advances_to(&self, next: WorkflowPhase) -> bool {
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub profile: Profile,
    pub debate_rounds: u32,
    pub enable_followup: bool,
    pub enable_websearch: bool,
    pub status: SessionStatus,
    pub phase: WorkflowPhase,
    pub current_debate_round: u32,
    pub synthesized_report: Option<String>,
    pub report_html_url: Option<String>,
    pub evidence_pack: Option<Value>,
    pub memory_snapshot: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(
        id: &str,
        profile: Profile,
        debate_rounds: u32,
        enable_followup: bool,
        enable_websearch: bool,
    ) -> Self {
        Self {
            id: id.to_string(),
            profile,
            debate_rounds,
            enable_followup,
            enable_websearch,
            status: SessionStatus::Pending,
            phase: WorkflowPhase::Init,
            current_debate_round: 0,
            synthesized_report: None,
            report_html_url: None,
            evidence_pack: None,
            memory_snapshot: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Partial session update; unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub phase: Option<WorkflowPhase>,
    pub current_debate_round: Option<u32>,
    pub synthesized_report: Option<String>,
    pub report_html_url: Option<String>,
    pub evidence_pack: Option<Value>,
    pub memory_snapshot: Option<Value>,
    pub error_message: Option<String>,
    pub enable_websearch: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One agent's result within a session; unique per (session, agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResultRecord {
    pub session_id: String,
    pub agent_name: String,
    pub content: String,
    pub thinking: Option<String>,
    pub sources: Vec<String>,
    pub confidence: f64,
    pub status: AgentStatus,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentResultRecord {
    /// A freshly started stage row.
    pub fn started(session_id: &str, agent_name: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_name: agent_name.to_string(),
            content: String::new(),
            thinking: None,
            sources: Vec::new(),
            confidence: 1.0,
            status: AgentStatus::Running,
            duration_ms: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// One debate exchange row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateExchangeRecord {
    pub session_id: String,
    pub round_number: u32,
    pub debate_type: DebateType,
    pub challenger: String,
    pub responder: String,
    pub challenge_content: String,
    pub response_content: String,
    pub followup_content: Option<String>,
    pub revised: bool,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEventRecord {
    pub session_id: String,
    pub event_type: String,
    pub agent_name: Option<String>,
    pub tool_name: Option<String>,
    pub node_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Tool invocation audit row; unique per invocation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub invocation_id: String,
    pub session_id: String,
    pub agent_name: Option<String>,
    pub tool_name: String,
    pub context: Option<String>,
    pub model_name: Option<String>,
    pub status: String,
    pub cache_hit: bool,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub estimated_input_tokens: Option<u64>,
    pub estimated_output_tokens: Option<u64>,
    pub estimated_cost_usd: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ToolInvocationRecord {
    pub fn pending(
        session_id: &str,
        invocation_id: &str,
        tool_name: &str,
        agent_name: Option<&str>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.to_string(),
            session_id: session_id.to_string(),
            agent_name: agent_name.map(String::from),
            tool_name: tool_name.to_string(),
            context: None,
            model_name: None,
            status: "pending".to_string(),
            cache_hit: false,
            input: None,
            output: None,
            error_message: None,
            duration_ms: None,
            estimated_input_tokens: None,
            estimated_output_tokens: None,
            estimated_cost_usd: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }
}

/// The persistence gateway surface. One connection pool behind it; callers
/// coordinate only through the row-level semantics the store provides.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert the session if absent; existing rows are left untouched.
    async fn create_session(&self, record: &SessionRecord) -> StoreResult<()>;

    /// Apply a partial update. Status regressions and phase rollbacks are
    /// ignored to keep the lifecycle monotonic.
    async fn update_session(&self, session_id: &str, update: SessionUpdate) -> StoreResult<()>;

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>>;

    async fn list_sessions(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<SessionRecord>>;

    async fn delete_session(&self, session_id: &str) -> StoreResult<()>;

    /// Upsert by (session, agent); the whole row is replaced.
    async fn upsert_agent_result(&self, record: &AgentResultRecord) -> StoreResult<()>;

    async fn list_agent_results(&self, session_id: &str) -> StoreResult<Vec<AgentResultRecord>>;

    async fn insert_debate_exchange(&self, record: &DebateExchangeRecord) -> StoreResult<()>;

    /// Ordered by (round_number, created_at).
    async fn list_debate_exchanges(
        &self,
        session_id: &str,
    ) -> StoreResult<Vec<DebateExchangeRecord>>;

    async fn insert_workflow_event(&self, record: &WorkflowEventRecord) -> StoreResult<()>;

    /// Ordered by created_at ascending.
    async fn list_workflow_events(
        &self,
        session_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowEventRecord>>;

    /// Upsert by invocation id; replaying the same id yields one row.
    async fn upsert_tool_invocation(&self, record: &ToolInvocationRecord) -> StoreResult<()>;

    async fn list_tool_invocations(
        &self,
        session_id: &str,
    ) -> StoreResult<Vec<ToolInvocationRecord>>;
}

/// Shared reference to a store.
pub type SharedStore = std::sync::Arc<dyn Store>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_monotonicity() {
        assert!(SessionStatus::Pending.may_transition_to(SessionStatus::Running));
        assert!(SessionStatus::Running.may_transition_to(SessionStatus::Completed));
        assert!(SessionStatus::Running.may_transition_to(SessionStatus::Failed));
        assert!(SessionStatus::Running.may_transition_to(SessionStatus::Cancelled));
        assert!(!SessionStatus::Completed.may_transition_to(SessionStatus::Running));
        assert!(!SessionStatus::Failed.may_transition_to(SessionStatus::Completed));
        assert!(!SessionStatus::Cancelled.may_transition_to(SessionStatus::Running));
    }

    #[test]
    fn test_phase_only_advances() {
        assert!(WorkflowPhase::Init.advances_to(WorkflowPhase::Gather));
        assert!(WorkflowPhase::Gather.advances_to(WorkflowPhase::DebatePeer));
        assert!(WorkflowPhase::DebatePeer.advances_to(WorkflowPhase::Synthesize));
        assert!(!WorkflowPhase::Synthesize.advances_to(WorkflowPhase::Gather));
        assert!(WorkflowPhase::Gather.advances_to(WorkflowPhase::Error));
        assert!(WorkflowPhase::Gather.advances_to(WorkflowPhase::Gather));
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_phase_parse_roundtrip() {
        for phase in [
            WorkflowPhase::Init,
            WorkflowPhase::Gather,
            WorkflowPhase::DebatePeer,
            WorkflowPhase::DebateRedteam,
            WorkflowPhase::Synthesize,
            WorkflowPhase::Complete,
            WorkflowPhase::Error,
        ] {
            assert_eq!(WorkflowPhase::parse(phase.as_str()), Some(phase));
        }
    }

    #[test]
    fn test_new_session_defaults() {
        let record = SessionRecord::new("s-1", Profile::default(), 2, true, false);
        assert_eq!(record.status, SessionStatus::Pending);
        assert_eq!(record.phase, WorkflowPhase::Init);
        assert_eq!(record.current_debate_round, 0);
        assert!(record.synthesized_report.is_none());
    }
}
