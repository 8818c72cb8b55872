//! Payload redaction before persistence.
//!
//! Tool inputs and outputs land in the audit tables; any field whose name
//! matches a sensitive pattern is replaced with a fixed placeholder before
//! the row is written.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

fn sensitive_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(api[_-]?key|secret|password|token|credential|authorization)")
            .expect("static regex compiles")
    })
}

/// Whether a field name must not be persisted verbatim.
pub fn is_sensitive_field(name: &str) -> bool {
    sensitive_field_regex().is_match(name)
}

/// Recursively replace values under sensitive keys.
pub fn redact_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted = map
                .iter()
                .map(|(k, v)| {
                    if is_sensitive_field(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_payload(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_payload).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_matching() {
        assert!(is_sensitive_field("api_key"));
        assert!(is_sensitive_field("API-KEY"));
        assert!(is_sensitive_field("ark_api_key"));
        assert!(is_sensitive_field("password"));
        assert!(is_sensitive_field("refresh_token"));
        assert!(is_sensitive_field("Authorization"));
        assert!(!is_sensitive_field("query"));
        assert!(!is_sensitive_field("market"));
    }

    #[test]
    fn test_redacts_nested_objects() {
        let payload = json!({
            "query": "trends in germany",
            "auth": {"api_key": "sk-12345", "region": "eu"},
            "results": [{"url": "https://a.example", "token": "abc"}],
        });
        let redacted = redact_payload(&payload);
        assert_eq!(redacted["query"], "trends in germany");
        assert_eq!(redacted["auth"]["api_key"], "[REDACTED]");
        assert_eq!(redacted["auth"]["region"], "eu");
        assert_eq!(redacted["results"][0]["token"], "[REDACTED]");
        assert_eq!(redacted["results"][0]["url"], "https://a.example");
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(redact_payload(&json!("plain")), json!("plain"));
        assert_eq!(redact_payload(&json!(42)), json!(42));
        assert_eq!(redact_payload(&Value::Null), Value::Null);
    }

    #[test]
    fn test_entire_sensitive_subtree_is_masked() {
        let payload = json!({"credentials": {"user": "a", "password": "b"}});
        let redacted = redact_payload(&payload);
        assert_eq!(redacted["credentials"], "[REDACTED]");
    }
}
