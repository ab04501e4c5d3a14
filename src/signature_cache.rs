// Thought-signature caches.
//
// Upstream binds tool-using reasoning turns to opaque `thoughtSignature`
// strings which must be replayed verbatim. Clients routinely drop them, so
// the relay remembers signatures under three recovery keys: the tool-use id,
// the user id (last seen), and a hash of the assistant content.

use crate::common::utils::now_ms;
use crate::config::RelayConfig;
use crate::storage::Store;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

const KIND_THINKING: &str = "thinking";
const KIND_LAST: &str = "last";
const KIND_ASSISTANT: &str = "assistant";

const CLEANUP_INTERVAL_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
struct CachedSignature {
    signature: String,
    saved_at_ms: i64,
}

#[derive(Debug, Clone)]
struct ThinkingRecord {
    signature: String,
    thought_text: Option<String>,
    saved_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SignatureTtls {
    pub tool_thought_ttl_ms: i64,
    pub tool_thought_max: usize,
    pub thinking_ttl_ms: i64,
    pub thinking_max: usize,
    pub last_ttl_ms: i64,
    pub last_max: usize,
    pub assistant_ttl_ms: i64,
    pub assistant_max: usize,
}

impl SignatureTtls {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self {
            tool_thought_ttl_ms: cfg.tool_thought_signature_ttl_ms,
            tool_thought_max: cfg.tool_thought_signature_max,
            thinking_ttl_ms: cfg.claude_thinking_signature_ttl_ms,
            thinking_max: cfg.claude_thinking_signature_max,
            last_ttl_ms: cfg.claude_last_signature_ttl_ms,
            last_max: cfg.claude_last_signature_max,
            assistant_ttl_ms: cfg.claude_assistant_signature_ttl_ms,
            assistant_max: cfg.claude_assistant_signature_max,
        }
    }
}

pub struct SignatureCache {
    tool_thoughts: DashMap<String, CachedSignature>,
    thinking: DashMap<String, ThinkingRecord>,
    last_user: DashMap<String, CachedSignature>,
    assistant: DashMap<String, CachedSignature>,
    store: Option<Arc<Store>>,
    ttls: SignatureTtls,
    last_cleanup_ms: Mutex<i64>,
}

impl SignatureCache {
    pub fn new(ttls: SignatureTtls, store: Option<Arc<Store>>) -> Self {
        Self {
            tool_thoughts: DashMap::new(),
            thinking: DashMap::new(),
            last_user: DashMap::new(),
            assistant: DashMap::new(),
            store,
            ttls,
            last_cleanup_ms: Mutex::new(0),
        }
    }

    // ===== tool-thought namespace (memory only, short TTL) =====

    pub fn cache_tool_thought_signature(&self, tool_call_id: &str, signature: &str) {
        self.cache_tool_thought_at(tool_call_id, signature, now_ms());
    }

    fn cache_tool_thought_at(&self, tool_call_id: &str, signature: &str, now: i64) {
        self.tool_thoughts.insert(
            tool_call_id.to_string(),
            CachedSignature {
                signature: signature.to_string(),
                saved_at_ms: now,
            },
        );
        evict_oldest(&self.tool_thoughts, self.ttls.tool_thought_max);
    }

    pub fn get_tool_thought_signature(&self, tool_call_id: &str) -> Option<String> {
        self.get_tool_thought_at(tool_call_id, now_ms())
    }

    fn get_tool_thought_at(&self, tool_call_id: &str, now: i64) -> Option<String> {
        let entry = self.tool_thoughts.get(tool_call_id)?;
        if now - entry.saved_at_ms > self.ttls.tool_thought_ttl_ms {
            drop(entry);
            self.tool_thoughts.remove(tool_call_id);
            return None;
        }
        Some(entry.signature.clone())
    }

    // ===== thinking namespace (per tool_use_id, persisted) =====

    pub fn cache_thinking_signature(
        &self,
        tool_use_id: &str,
        signature: &str,
        thought_text: Option<&str>,
    ) {
        self.cache_thinking_at(tool_use_id, signature, thought_text, now_ms());
    }

    fn cache_thinking_at(
        &self,
        tool_use_id: &str,
        signature: &str,
        thought_text: Option<&str>,
        now: i64,
    ) {
        self.thinking.insert(
            tool_use_id.to_string(),
            ThinkingRecord {
                signature: signature.to_string(),
                thought_text: thought_text.map(|s| s.to_string()),
                saved_at_ms: now,
            },
        );
        evict_oldest_by(&self.thinking, self.ttls.thinking_max, |r| r.saved_at_ms);
        self.persist(KIND_THINKING, tool_use_id, signature, now);
        self.maybe_cleanup(now);
    }

    pub fn get_thinking_signature(&self, tool_use_id: &str) -> Option<String> {
        self.get_thinking_record(tool_use_id).map(|(sig, _)| sig)
    }

    /// Signature plus the thought text the turn carried, if remembered.
    pub fn get_thinking_record(&self, tool_use_id: &str) -> Option<(String, Option<String>)> {
        self.get_thinking_record_at(tool_use_id, now_ms())
    }

    fn get_thinking_record_at(
        &self,
        tool_use_id: &str,
        now: i64,
    ) -> Option<(String, Option<String>)> {
        if let Some(entry) = self.thinking.get(tool_use_id) {
            if now - entry.saved_at_ms <= self.ttls.thinking_ttl_ms {
                return Some((entry.signature.clone(), entry.thought_text.clone()));
            }
            drop(entry);
            self.thinking.remove(tool_use_id);
        }
        // Memory miss: survive restarts via the persisted row.
        let (signature, saved_at) = self.load(KIND_THINKING, tool_use_id)?;
        if now - saved_at > self.ttls.thinking_ttl_ms {
            return None;
        }
        self.thinking.insert(
            tool_use_id.to_string(),
            ThinkingRecord {
                signature: signature.clone(),
                thought_text: None,
                saved_at_ms: saved_at,
            },
        );
        Some((signature, None))
    }

    // ===== per-user last-signature fallback (persisted) =====

    pub fn cache_last_thinking_signature(&self, user_id: &str, signature: &str) {
        self.cache_last_at(user_id, signature, now_ms());
    }

    fn cache_last_at(&self, user_id: &str, signature: &str, now: i64) {
        self.last_user.insert(
            user_id.to_string(),
            CachedSignature {
                signature: signature.to_string(),
                saved_at_ms: now,
            },
        );
        evict_oldest(&self.last_user, self.ttls.last_max);
        self.persist(KIND_LAST, user_id, signature, now);
        self.maybe_cleanup(now);
    }

    pub fn get_last_thinking_signature(&self, user_id: &str) -> Option<String> {
        self.get_last_at(user_id, now_ms())
    }

    fn get_last_at(&self, user_id: &str, now: i64) -> Option<String> {
        if let Some(entry) = self.last_user.get(user_id) {
            if now - entry.saved_at_ms <= self.ttls.last_ttl_ms {
                return Some(entry.signature.clone());
            }
            drop(entry);
            self.last_user.remove(user_id);
        }
        let (signature, saved_at) = self.load(KIND_LAST, user_id)?;
        if now - saved_at > self.ttls.last_ttl_ms {
            return None;
        }
        self.last_user.insert(
            user_id.to_string(),
            CachedSignature {
                signature: signature.clone(),
                saved_at_ms: saved_at,
            },
        );
        Some(signature)
    }

    // ===== assistant content-hash fallback (persisted) =====

    pub fn cache_assistant_signature(&self, user_id: &str, content: &Value, signature: &str) {
        let key = assistant_key(user_id, content);
        let now = now_ms();
        self.assistant.insert(
            key.clone(),
            CachedSignature {
                signature: signature.to_string(),
                saved_at_ms: now,
            },
        );
        evict_oldest(&self.assistant, self.ttls.assistant_max);
        self.persist(KIND_ASSISTANT, &key, signature, now);
        self.maybe_cleanup(now);
    }

    /// Recover a signature for an identical historical assistant message.
    pub fn get_assistant_signature(&self, user_id: &str, content: &Value) -> Option<String> {
        let key = assistant_key(user_id, content);
        let now = now_ms();
        if let Some(entry) = self.assistant.get(&key) {
            if now - entry.saved_at_ms <= self.ttls.assistant_ttl_ms {
                return Some(entry.signature.clone());
            }
            drop(entry);
            self.assistant.remove(&key);
        }
        let (signature, saved_at) = self.load(KIND_ASSISTANT, &key)?;
        if now - saved_at > self.ttls.assistant_ttl_ms {
            return None;
        }
        self.assistant.insert(
            key,
            CachedSignature {
                signature: signature.clone(),
                saved_at_ms: saved_at,
            },
        );
        Some(signature)
    }

    // ===== persistence plumbing =====

    fn persist(&self, kind: &str, cache_key: &str, signature: &str, now: i64) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_signature(kind, cache_key, signature, now) {
                tracing::warn!("failed to persist {} signature: {}", kind, e);
            }
        }
    }

    fn load(&self, kind: &str, cache_key: &str) -> Option<(String, i64)> {
        let store = self.store.as_ref()?;
        match store.get_signature(kind, cache_key) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!("failed to load {} signature: {}", kind, e);
                None
            }
        }
    }

    /// Expire persisted rows, at most once per five minutes.
    fn maybe_cleanup(&self, now: i64) {
        let Some(store) = &self.store else { return };
        {
            let mut last = self.last_cleanup_ms.lock().expect("cleanup lock poisoned");
            if now - *last < CLEANUP_INTERVAL_MS {
                return;
            }
            *last = now;
        }
        for (kind, ttl) in [
            (KIND_THINKING, self.ttls.thinking_ttl_ms),
            (KIND_LAST, self.ttls.last_ttl_ms),
            (KIND_ASSISTANT, self.ttls.assistant_ttl_ms),
        ] {
            match store.delete_signatures_older_than(kind, now - ttl) {
                Ok(0) => {}
                Ok(n) => tracing::debug!("expired {} stale {} signature rows", n, kind),
                Err(e) => tracing::warn!("signature cleanup failed for {}: {}", kind, e),
            }
        }
    }
}

fn assistant_key(user_id: &str, content: &Value) -> String {
    format!("{}:{}", user_id, content_hash(content))
}

/// SHA-256 over a canonical serialisation: object keys sorted ascending,
/// arrays in order, no whitespace.
pub fn content_hash(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(arr) => {
            out.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn evict_oldest(map: &DashMap<String, CachedSignature>, max: usize) {
    evict_oldest_by(map, max, |e| e.saved_at_ms);
}

fn evict_oldest_by<V, F>(map: &DashMap<String, V>, max: usize, saved_at: F)
where
    F: Fn(&V) -> i64,
{
    if max == 0 || map.len() <= max {
        return;
    }
    let mut oldest: Option<(String, i64)> = None;
    for entry in map.iter() {
        let ts = saved_at(entry.value());
        if oldest.as_ref().map(|(_, t)| ts < *t).unwrap_or(true) {
            oldest = Some((entry.key().clone(), ts));
        }
    }
    if let Some((key, _)) = oldest {
        map.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_ttls() -> SignatureTtls {
        SignatureTtls {
            tool_thought_ttl_ms: 10 * 60 * 1000,
            tool_thought_max: 3,
            thinking_ttl_ms: 24 * 60 * 60 * 1000,
            thinking_max: 100,
            last_ttl_ms: 24 * 60 * 60 * 1000,
            last_max: 100,
            assistant_ttl_ms: 24 * 60 * 60 * 1000,
            assistant_max: 100,
        }
    }

    #[test]
    fn tool_thought_respects_ttl_and_cap() {
        let cache = SignatureCache::new(test_ttls(), None);
        cache.cache_tool_thought_at("call_a", "sig-a", 1000);
        assert_eq!(
            cache.get_tool_thought_at("call_a", 2000),
            Some("sig-a".to_string())
        );
        // Past TTL the entry is gone.
        assert_eq!(
            cache.get_tool_thought_at("call_a", 1000 + 10 * 60 * 1000 + 1),
            None
        );

        // Cap 3: the oldest entry is evicted on overflow.
        cache.cache_tool_thought_at("c1", "s1", 10);
        cache.cache_tool_thought_at("c2", "s2", 20);
        cache.cache_tool_thought_at("c3", "s3", 30);
        cache.cache_tool_thought_at("c4", "s4", 40);
        assert_eq!(cache.get_tool_thought_at("c1", 50), None);
        assert_eq!(cache.get_tool_thought_at("c4", 50), Some("s4".to_string()));
    }

    #[test]
    fn thinking_signature_survives_memory_loss() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = SignatureCache::new(test_ttls(), Some(store.clone()));
        cache.cache_thinking_signature("toolu_1", "sig-x", Some("I pondered"));

        assert_eq!(
            cache.get_thinking_record("toolu_1"),
            Some(("sig-x".to_string(), Some("I pondered".to_string())))
        );

        // Fresh cache over the same store: thought text is memory-only, the
        // signature reloads from the persisted row.
        let cold = SignatureCache::new(test_ttls(), Some(store));
        assert_eq!(
            cold.get_thinking_record("toolu_1"),
            Some(("sig-x".to_string(), None))
        );
    }

    #[test]
    fn last_and_assistant_fallbacks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = SignatureCache::new(test_ttls(), Some(store));

        cache.cache_last_thinking_signature("user-1", "sig-last");
        assert_eq!(
            cache.get_last_thinking_signature("user-1"),
            Some("sig-last".to_string())
        );
        assert_eq!(cache.get_last_thinking_signature("user-2"), None);

        let content = json!([{"type": "text", "text": "answer"}]);
        cache.cache_assistant_signature("user-1", &content, "sig-hash");
        assert_eq!(
            cache.get_assistant_signature("user-1", &content),
            Some("sig-hash".to_string())
        );
        // Different content, different hash.
        let other = json!([{"type": "text", "text": "other"}]);
        assert_eq!(cache.get_assistant_signature("user-1", &other), None);
    }

    #[test]
    fn content_hash_is_key_order_independent() {
        let a = json!({"b": 1, "a": [2, 3], "c": {"y": true, "x": null}});
        let b = json!({"c": {"x": null, "y": true}, "a": [2, 3], "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));

        // Array order matters.
        let c = json!({"a": [3, 2], "b": 1, "c": {"x": null, "y": true}});
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn thinking_ttl_expiry() {
        let cache = SignatureCache::new(test_ttls(), None);
        cache.cache_thinking_at("toolu_old", "sig", None, 0);
        assert!(cache
            .get_thinking_record_at("toolu_old", 24 * 60 * 60 * 1000 + 1)
            .is_none());
    }
}
