//! In-memory tool-result cache.
//!
//! TTL + LRU, scoped per session: a cache entry never crosses session
//! boundaries because the session scope is part of the key. Instant-based
//! expiry so tests can fake time by shrinking the TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    last_used: Instant,
}

/// Lightweight cache for the web-search call path.
pub struct ToolCache {
    ttl: Duration,
    max_size: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ToolCache {
    pub fn new(ttl_seconds: u64, max_size: usize) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_seconds.max(1)),
            max_size: max_size.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic key over the tool, canonicalized input, and the
    /// session scope.
    pub fn build_key(tool_name: &str, input: &Value, session_id: &str) -> String {
        let canonical = canonical_json(input);
        let mut hasher = Sha256::new();
        hasher.update(tool_name.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical.as_bytes());
        hasher.update(b"\n");
        hasher.update(session_id.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: String, value: Value) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
                last_used: now,
            },
        );

        while entries.len() > self.max_size {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new(300, 128)
    }
}

/// JSON serialization with object keys sorted, so logically equal inputs
/// hash identically.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = ToolCache::default();
        let key = ToolCache::build_key("web_search", &json!({"q": "emerging trends"}), "s-1");
        cache.put(key.clone(), json!({"results": ["a"]})).await;
        assert_eq!(cache.get(&key).await, Some(json!({"results": ["a"]})));
    }

    #[tokio::test]
    async fn test_miss_on_absent_key() {
        let cache = ToolCache::default();
        assert_eq!(cache.get("nope").await, None);
    }

    #[test]
    fn test_key_is_session_scoped() {
        let input = json!({"q": "x"});
        let a = ToolCache::build_key("web_search", &input, "s-1");
        let b = ToolCache::build_key("web_search", &input, "s-2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_canonicalizes_object_order() {
        let a = ToolCache::build_key("t", &json!({"a": 1, "b": 2}), "s");
        let b = ToolCache::build_key("t", &json!({"b": 2, "a": 1}), "s");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = ToolCache::new(300, 2);
        cache.put("k1".into(), json!(1)).await;
        cache.put("k2".into(), json!(2)).await;
        // Touch k1 so k2 becomes the eviction candidate.
        let _ = cache.get("k1").await;
        cache.put("k3".into(), json!(3)).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("k1").await.is_some());
        assert!(cache.get("k3").await.is_some());
        assert!(cache.get("k2").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped() {
        let cache = ToolCache::new(1, 8);
        cache.put("k".into(), json!(1)).await;
        // Force expiry by replacing the entry's deadline.
        {
            let mut entries = cache.entries.lock().await;
            if let Some(entry) = entries.get_mut("k") {
                entry.expires_at = Instant::now() - Duration::from_secs(1);
            }
        }
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty().await);
    }
}
