//! Workflow event types.
//!
//! Every lifecycle transition the engine makes is expressed as one of these
//! events. They drive the SSE stream, the persistence sink, and the audit
//! log, so the serialized shape is the wire contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal and in-flight states of a single agent stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Degraded,
    Skipped,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Whether the stage has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which kind of critique a debate round runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateType {
    PeerReview,
    RedTeam,
}

impl DebateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerReview => "peer_review",
            Self::RedTeam => "red_team",
        }
    }
}

impl std::fmt::Display for DebateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// All workflow events, serialized with an `event` discriminator so the
/// JSON matches the SSE taxonomy exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    OrchestratorStart {
        session_id: String,
        agents: Vec<String>,
        debate_rounds: u32,
        timestamp: DateTime<Utc>,
    },

    OrchestratorEnd {
        session_id: String,
        final_report: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        report_html_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        evidence_pack: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        memory_snapshot: Option<Value>,
        timestamp: DateTime<Utc>,
    },

    AgentStart {
        agent: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Incremental thinking text. Not persisted individually.
    AgentThinkingChunk { agent: String, content: String },

    /// Incremental report text. Not persisted individually.
    AgentChunk { agent: String, content: String },

    AgentEnd {
        agent: String,
        status: AgentStatus,
        duration_ms: u64,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    AgentError {
        agent: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    ToolStart {
        invocation_id: String,
        tool: String,
        agent: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        model_name: String,
        cache_hit: bool,
        input: Value,
        timestamp: DateTime<Utc>,
    },

    ToolEnd {
        invocation_id: String,
        tool: String,
        agent: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        model_name: String,
        cache_hit: bool,
        input: Value,
        output: Value,
        duration_ms: u64,
        estimated_input_tokens: u64,
        estimated_output_tokens: u64,
        estimated_cost_usd: f64,
        cost_mode: String,
        timestamp: DateTime<Utc>,
    },

    ToolError {
        invocation_id: String,
        tool: String,
        agent: String,
        error: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    GuardrailTriggered {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        rule: String,
        details: Value,
        timestamp: DateTime<Utc>,
    },

    Retry {
        target_type: String,
        target_id: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
        backoff_ms: u64,
        timestamp: DateTime<Utc>,
    },

    DebateRoundStart {
        round_number: u32,
        debate_type: DebateType,
        participants: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    DebateRoundEnd {
        round_number: u32,
        exchanges_count: usize,
        timestamp: DateTime<Utc>,
    },

    AgentChallenge {
        round_number: u32,
        from_agent: String,
        to_agent: String,
        timestamp: DateTime<Utc>,
    },

    AgentChallengeEnd {
        round_number: u32,
        from_agent: String,
        to_agent: String,
        challenge_content: String,
        timestamp: DateTime<Utc>,
    },

    AgentRespond {
        round_number: u32,
        from_agent: String,
        to_agent: String,
        timestamp: DateTime<Utc>,
    },

    AgentRespondEnd {
        round_number: u32,
        from_agent: String,
        to_agent: String,
        response_content: String,
        revised: bool,
        timestamp: DateTime<Utc>,
    },

    AgentFollowup {
        round_number: u32,
        from_agent: String,
        to_agent: String,
        timestamp: DateTime<Utc>,
    },

    AgentFollowupEnd {
        round_number: u32,
        from_agent: String,
        to_agent: String,
        followup_content: String,
        timestamp: DateTime<Utc>,
    },

    ConsensusReached {
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        timestamp: DateTime<Utc>,
    },

    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    /// Wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::OrchestratorStart { .. } => "orchestrator_start",
            Self::OrchestratorEnd { .. } => "orchestrator_end",
            Self::AgentStart { .. } => "agent_start",
            Self::AgentThinkingChunk { .. } => "agent_thinking_chunk",
            Self::AgentChunk { .. } => "agent_chunk",
            Self::AgentEnd { .. } => "agent_end",
            Self::AgentError { .. } => "agent_error",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::ToolError { .. } => "tool_error",
            Self::GuardrailTriggered { .. } => "guardrail_triggered",
            Self::Retry { .. } => "retry",
            Self::DebateRoundStart { .. } => "debate_round_start",
            Self::DebateRoundEnd { .. } => "debate_round_end",
            Self::AgentChallenge { .. } => "agent_challenge",
            Self::AgentChallengeEnd { .. } => "agent_challenge_end",
            Self::AgentRespond { .. } => "agent_respond",
            Self::AgentRespondEnd { .. } => "agent_respond_end",
            Self::AgentFollowup { .. } => "agent_followup",
            Self::AgentFollowupEnd { .. } => "agent_followup_end",
            Self::ConsensusReached { .. } => "consensus_reached",
            Self::Error { .. } => "error",
        }
    }

    /// Incremental text events; skipped by the audit log.
    pub fn is_chunk(&self) -> bool {
        matches!(
            self,
            Self::AgentThinkingChunk { .. } | Self::AgentChunk { .. }
        )
    }

    /// Agent name this event concerns, when there is one.
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::AgentStart { agent, .. }
            | Self::AgentThinkingChunk { agent, .. }
            | Self::AgentChunk { agent, .. }
            | Self::AgentEnd { agent, .. }
            | Self::AgentError { agent, .. }
            | Self::ToolStart { agent, .. }
            | Self::ToolEnd { agent, .. }
            | Self::ToolError { agent, .. } => Some(agent),
            Self::AgentChallenge { from_agent, .. }
            | Self::AgentChallengeEnd { from_agent, .. }
            | Self::AgentRespond { from_agent, .. }
            | Self::AgentRespondEnd { from_agent, .. }
            | Self::AgentFollowup { from_agent, .. }
            | Self::AgentFollowupEnd { from_agent, .. } => Some(from_agent),
            Self::GuardrailTriggered { agent, .. } => agent.as_deref(),
            _ => None,
        }
    }

    /// Tool name this event concerns, when there is one.
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::ToolStart { tool, .. }
            | Self::ToolEnd { tool, .. }
            | Self::ToolError { tool, .. } => Some(tool),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = WorkflowEvent::AgentStart {
            agent: "trend_scout".to_string(),
            task: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "agent_start");
        assert_eq!(json["agent"], "trend_scout");
        assert!(json.get("task").is_none());
    }

    #[test]
    fn test_event_roundtrip() {
        let event = WorkflowEvent::Retry {
            target_type: "agent".to_string(),
            target_id: "competitor_analyst".to_string(),
            attempt: 1,
            max_attempts: 3,
            error: "connection reset".to_string(),
            backoff_ms: 300,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "retry");
    }

    #[test]
    fn test_chunk_detection() {
        let chunk = WorkflowEvent::AgentChunk {
            agent: "trend_scout".to_string(),
            content: "x".to_string(),
        };
        let thinking = WorkflowEvent::AgentThinkingChunk {
            agent: "trend_scout".to_string(),
            content: "y".to_string(),
        };
        assert!(chunk.is_chunk());
        assert!(thinking.is_chunk());
        assert!(!WorkflowEvent::Error {
            session_id: None,
            error: "boom".to_string(),
            timestamp: Utc::now(),
        }
        .is_chunk());
    }

    #[test]
    fn test_agent_accessor_on_debate_events() {
        let event = WorkflowEvent::AgentChallengeEnd {
            round_number: 1,
            from_agent: "trend_scout".to_string(),
            to_agent: "competitor_analyst".to_string(),
            challenge_content: "c".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.agent(), Some("trend_scout"));
    }

    #[test]
    fn test_debate_type_serialization() {
        assert_eq!(
            serde_json::to_string(&DebateType::PeerReview).unwrap(),
            "\"peer_review\""
        );
        assert_eq!(
            serde_json::to_string(&DebateType::RedTeam).unwrap(),
            "\"red_team\""
        );
    }

    #[test]
    fn test_agent_status_terminal() {
        assert!(AgentStatus::Completed.is_terminal());
        assert!(AgentStatus::Degraded.is_terminal());
        assert!(AgentStatus::Skipped.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
        assert!(!AgentStatus::Running.is_terminal());
        assert!(!AgentStatus::Pending.is_terminal());
    }
}
