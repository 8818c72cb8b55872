//! Agent roles and execution context.
//!
//! Six roles: four parallel analysts (the gather phase), a terminal
//! synthesizer, and a critique agent used during red-team debate.

use serde::{Deserialize, Serialize};

use crate::store::AgentResultRecord;

pub mod extract;
pub mod prompts;
pub mod stage;

/// The fixed set of agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    TrendScout,
    CompetitorAnalyst,
    RegulationChecker,
    SocialSentinel,
    Synthesizer,
    DebateChallenger,
}

/// The four analysts executed concurrently during gather.
pub const WORKER_AGENTS: [AgentName; 4] = [
    AgentName::TrendScout,
    AgentName::CompetitorAnalyst,
    AgentName::RegulationChecker,
    AgentName::SocialSentinel,
];

impl AgentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrendScout => "trend_scout",
            Self::CompetitorAnalyst => "competitor_analyst",
            Self::RegulationChecker => "regulation_checker",
            Self::SocialSentinel => "social_sentinel",
            Self::Synthesizer => "synthesizer",
            Self::DebateChallenger => "debate_challenger",
        }
    }

    /// Human-facing role title used inside prompts.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::TrendScout => "Trend Scout",
            Self::CompetitorAnalyst => "Competitor Analyst",
            Self::RegulationChecker => "Regulation Checker",
            Self::SocialSentinel => "Social Sentinel",
            Self::Synthesizer => "Synthesizer",
            Self::DebateChallenger => "Red-Team Reviewer",
        }
    }

    /// One-line role description surfaced in `agent_start` payloads.
    pub fn description(&self) -> &'static str {
        match self {
            Self::TrendScout => "spots emerging market trends and opportunity windows",
            Self::CompetitorAnalyst => "maps the competitive landscape and benchmark products",
            Self::RegulationChecker => "reviews compliance risk and policy constraints",
            Self::SocialSentinel => "monitors social sentiment and consumer signals",
            Self::Synthesizer => "weaves every analysis into the final report",
            Self::DebateChallenger => "critically reviews and challenges the analyses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trend_scout" => Some(Self::TrendScout),
            "competitor_analyst" => Some(Self::CompetitorAnalyst),
            "regulation_checker" => Some(Self::RegulationChecker),
            "social_sentinel" => Some(Self::SocialSentinel),
            "synthesizer" => Some(Self::Synthesizer),
            "debate_challenger" => Some(Self::DebateChallenger),
            _ => None,
        }
    }

    pub fn is_worker(&self) -> bool {
        WORKER_AGENTS.contains(self)
    }
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Business profile a run analyzes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub target_market: String,
    #[serde(default)]
    pub supply_chain: String,
    #[serde(default)]
    pub seller_type: String,
    #[serde(default)]
    pub min_price: i64,
    #[serde(default)]
    pub max_price: i64,
}

impl Profile {
    pub fn price_range(&self) -> String {
        format!("${}-${}", self.min_price, self.max_price)
    }
}

/// Context handed to prompt builders.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub session_id: String,
    pub profile: Profile,
    /// Sibling results, populated for the synthesizer and the challenger.
    pub other_agent_outputs: Vec<AgentResultRecord>,
    pub debate_round: u32,
}

impl AgentContext {
    pub fn new(session_id: &str, profile: Profile) -> Self {
        Self {
            session_id: session_id.to_string(),
            profile,
            other_agent_outputs: Vec::new(),
            debate_round: 0,
        }
    }

    pub fn output_of(&self, agent: AgentName) -> Option<&AgentResultRecord> {
        self.other_agent_outputs
            .iter()
            .find(|r| r.agent_name == agent.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_names() {
        for agent in [
            AgentName::TrendScout,
            AgentName::CompetitorAnalyst,
            AgentName::RegulationChecker,
            AgentName::SocialSentinel,
            AgentName::Synthesizer,
            AgentName::DebateChallenger,
        ] {
            assert_eq!(AgentName::parse(agent.as_str()), Some(agent));
        }
        assert_eq!(AgentName::parse("unknown"), None);
    }

    #[test]
    fn test_worker_set() {
        assert!(AgentName::TrendScout.is_worker());
        assert!(!AgentName::Synthesizer.is_worker());
        assert!(!AgentName::DebateChallenger.is_worker());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&AgentName::CompetitorAnalyst).unwrap();
        assert_eq!(json, "\"competitor_analyst\"");
    }

    #[test]
    fn test_profile_price_range() {
        let profile = Profile {
            min_price: 30,
            max_price: 90,
            ..Default::default()
        };
        assert_eq!(profile.price_range(), "$30-$90");
    }
}
