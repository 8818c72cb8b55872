//! Retry and degradation policy.
//!
//! Every stage invocation runs under the same contract: bounded retries with
//! exponential backoff, then one of three terminal modes. Jitter is derived
//! from a stable hash of the target so concurrent stages never retry in
//! lockstep, and tests stay deterministic.

use serde::{Deserialize, Serialize};

/// What happens to a stage once its retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeMode {
    /// Keep the run alive; the stage lands as degraded (gather) or
    /// failed (synthesizer) and downstream consumers get partial input.
    Partial,
    /// Drop the stage result entirely and proceed.
    Skip,
    /// Abort the whole session.
    Fail,
}

impl DegradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Partial => "partial",
            Self::Skip => "skip",
            Self::Fail => "fail",
        }
    }

    /// Parse with the permissive fallback the API contract promises.
    pub fn parse_or_default(value: &str) -> Self {
        match value {
            "skip" => Self::Skip,
            "fail" => Self::Fail,
            _ => Self::Partial,
        }
    }
}

impl Default for DegradeMode {
    fn default() -> Self {
        Self::Partial
    }
}

impl std::fmt::Display for DegradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bounded-retry settings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Clamped to at least 1.
    pub max_attempts: u32,
    /// Base backoff in milliseconds; doubled per attempt.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_ms,
        }
    }

    /// Backoff before retrying after `attempt` (1-based) failed.
    ///
    /// `backoff_ms * 2^(attempt-1)` plus a stable 0-40% jitter keyed on the
    /// target identity, so two agents failing together fan out.
    pub fn backoff_for(&self, attempt: u32, jitter_key: &str) -> u64 {
        if self.backoff_ms == 0 {
            return 0;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_ms.saturating_mul(1u64 << exponent);
        let bucket = stable_jitter_bucket(jitter_key, attempt);
        delay + self.backoff_ms * bucket / 100
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_ms: 300,
        }
    }
}

/// Deterministic jitter bucket in 0..=40 (percent of base backoff).
fn stable_jitter_bucket(key: &str, attempt: u32) -> u64 {
    let token = format!("{}:{}", key, attempt);
    let sum: u64 = token.bytes().map(u64::from).sum();
    sum % 41
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrade_mode_parse() {
        assert_eq!(DegradeMode::parse_or_default("skip"), DegradeMode::Skip);
        assert_eq!(DegradeMode::parse_or_default("fail"), DegradeMode::Fail);
        assert_eq!(DegradeMode::parse_or_default("partial"), DegradeMode::Partial);
        assert_eq!(DegradeMode::parse_or_default("bogus"), DegradeMode::Partial);
    }

    #[test]
    fn test_retry_bound() {
        let policy = RetryPolicy::new(3, 100);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_min_one_attempt() {
        let policy = RetryPolicy::new(0, 100);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy::new(4, 100);
        let b1 = policy.backoff_for(1, "agent");
        let b2 = policy.backoff_for(2, "agent");
        let b3 = policy.backoff_for(3, "agent");
        // Base doubles each attempt; jitter adds at most 40% of base.
        assert!((100..=140).contains(&b1));
        assert!((200..=240).contains(&b2));
        assert!((400..=440).contains(&b3));
    }

    #[test]
    fn test_backoff_zero_base_stays_zero() {
        let policy = RetryPolicy::new(3, 0);
        assert_eq!(policy.backoff_for(1, "x"), 0);
        assert_eq!(policy.backoff_for(2, "x"), 0);
    }

    #[test]
    fn test_jitter_is_stable_per_key() {
        let policy = RetryPolicy::new(3, 100);
        assert_eq!(policy.backoff_for(1, "a"), policy.backoff_for(1, "a"));
    }

    #[test]
    fn test_jitter_spreads_different_keys() {
        // Not guaranteed for every pair, but these specific keys differ.
        let policy = RetryPolicy::new(3, 1000);
        let a = policy.backoff_for(1, "trend_scout");
        let b = policy.backoff_for(1, "competitor_analyst");
        assert_ne!(a, b);
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&DegradeMode::Partial).unwrap();
        assert_eq!(json, "\"partial\"");
        let parsed: DegradeMode = serde_json::from_str("\"fail\"").unwrap();
        assert_eq!(parsed, DegradeMode::Fail);
    }
}
