// src/cache/mod.rs
//
//! Process-local, TTL-evicting cache shared by the Embedding Client (C1),
//! the LLM Client's caching wrapper (C3) and the Orchestrator's response
//! cache (C13). Modelled on the teacher's `cache::LlmCache`, but in-memory
//! rather than SQLite-backed: §3.3/§4.1/§4.3/§4.13 only require ephemeral,
//! process-local caching with TTL eviction, so the heavier SQLite-backed
//! persistence the teacher uses for cross-restart LLM cost tracking is not
//! needed here (dropped dependency, see DESIGN.md).
//!
//! Concurrent read/insert is safe (§5): a `parking_lot::Mutex`-guarded map,
//! with eviction races tolerated as a benign double-store, matching the
//! concurrency model's "Shared mutable state" section.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded-lifetime key/value cache. `ttl` is fixed per instance, matching
/// each caller's single default TTL (embedding cache 1h, LLM cache 10m,
/// response cache 5m).
pub struct TtlCache<V: Clone> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, value: V) {
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cryptographic digest used as a cache key, per §4.1 ("keyed by a
/// cryptographic digest of the preprocessed text") and §4.3/§4.13
/// ("digest of (prompt, model, opts)" / "hash(normalized(query))").
pub fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_and_order_sensitive() {
        let a = digest(&["hello", "gpt", "{}"]);
        let b = digest(&["hello", "gpt", "{}"]);
        let c = digest(&["gpt", "hello", "{}"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ttl_cache_expires() {
        let cache: TtlCache<i32> = TtlCache::new(Duration::from_millis(10));
        cache.insert("k".into(), 42);
        assert_eq!(cache.get("k"), Some(42));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
    }
}
