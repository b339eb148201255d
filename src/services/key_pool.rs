//! API key pool management
//!
//! Round-robin selection over a comma-delimited key list with failure
//! marking and self-healing. One pool per credential-set id, cached in an
//! explicit registry owned by the application state for the process
//! lifetime (or until cleared, e.g. on logout).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Round-robin key pool for one credential set
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<String>,
    failed: HashSet<String>,
    cursor: usize,
    last_used: HashMap<String, DateTime<Utc>>,
}

/// Read-only snapshot of a pool for observability
#[derive(Debug, Clone, Serialize)]
pub struct KeyPoolStats {
    pub total: usize,
    pub available: usize,
    pub failed: usize,
    pub keys: Vec<KeyStatus>,
}

/// Per-key status with the key displayed masked
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl KeyPool {
    /// Create a pool from a comma-delimited keys string
    pub fn new(keys_string: &str) -> Self {
        Self {
            keys: parse_keys(keys_string),
            failed: HashSet::new(),
            cursor: 0,
            last_used: HashMap::new(),
        }
    }

    /// Get the next available key, round-robin.
    ///
    /// If every key is marked failed the pool self-heals by clearing the
    /// failed set and starting over from the first key - a likely-repeat
    /// failure is preferable to total unavailability. Returns `None` only
    /// when the configured key list is empty.
    pub fn next_key(&mut self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }

        let available: Vec<&String> = self
            .keys
            .iter()
            .filter(|k| !self.failed.contains(*k))
            .collect();

        let key = if available.is_empty() {
            warn!(
                "All {} keys marked failed, clearing failed set and starting over",
                self.keys.len()
            );
            self.failed.clear();
            self.cursor = 1 % self.keys.len();
            self.keys[0].clone()
        } else {
            let key = available[self.cursor % available.len()].clone();
            self.cursor = (self.cursor + 1) % available.len();
            key
        };

        self.last_used.insert(key.clone(), Utc::now());
        Some(key)
    }

    /// Mark a key as failed. Idempotent; unknown keys are ignored.
    pub fn mark_failed(&mut self, key: &str, reason: &str) {
        if !self.keys.iter().any(|k| k == key) {
            return;
        }
        if self.failed.insert(key.to_string()) {
            warn!("Key {} marked failed: {}", mask_key(key), reason);
        }
    }

    /// Restore a previously failed key
    pub fn restore_key(&mut self, key: &str) {
        if self.failed.remove(key) {
            info!("Key {} restored", mask_key(key));
        }
    }

    /// Whether at least one key is currently usable
    pub fn has_available_key(&self) -> bool {
        self.keys.iter().any(|k| !self.failed.contains(k))
    }

    /// Snapshot of pool state with masked keys
    pub fn stats(&self) -> KeyPoolStats {
        let keys: Vec<KeyStatus> = self
            .keys
            .iter()
            .map(|k| KeyStatus {
                key: mask_key(k),
                status: if self.failed.contains(k) { "failed" } else { "active" },
                last_used: self.last_used.get(k).copied(),
            })
            .collect();

        KeyPoolStats {
            total: self.keys.len(),
            available: keys.iter().filter(|k| k.status == "active").count(),
            failed: keys.iter().filter(|k| k.status == "failed").count(),
            keys,
        }
    }

    /// Replace the key list, preserving failed status only for keys that
    /// are still present. The rotation cursor restarts from the front.
    pub fn update_keys(&mut self, new_keys_string: &str) {
        let new_keys = parse_keys(new_keys_string);
        self.failed.retain(|k| new_keys.contains(k));
        self.last_used.retain(|k, _| new_keys.contains(k));
        self.keys = new_keys;
        self.cursor = 0;
        info!("Key list updated: {} keys", self.keys.len());
    }

    /// Canonical comma-delimited form of the configured keys
    pub fn storage_string(&self) -> String {
        self.keys.join(",")
    }
}

/// Registry of key pools, one per credential-set id.
///
/// Owned by the application state and passed by reference into adapter
/// construction, so pool state survives across requests from the same
/// configuration without hidden global state.
#[derive(Debug, Default)]
pub struct KeyPoolRegistry {
    pools: Mutex<HashMap<String, Arc<Mutex<KeyPool>>>>,
}

impl KeyPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the pool for a credential-set id.
    ///
    /// If the stored keys string differs from the cached pool's, the pool
    /// is updated in place so edited configurations take effect while
    /// preserving failure state for unchanged keys.
    pub fn get(&self, id: &str, keys_string: &str) -> Arc<Mutex<KeyPool>> {
        let mut pools = self.pools.lock().expect("key pool registry poisoned");
        let pool = pools
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("Creating key pool for credential set '{}'", id);
                Arc::new(Mutex::new(KeyPool::new(keys_string)))
            })
            .clone();
        drop(pools);

        {
            let mut guard = pool.lock().expect("key pool poisoned");
            if guard.storage_string() != parse_keys(keys_string).join(",") {
                guard.update_keys(keys_string);
            }
        }

        pool
    }

    /// Drop all cached pools (e.g. on logout)
    pub fn clear(&self) {
        self.pools.lock().expect("key pool registry poisoned").clear();
        info!("Key pool registry cleared");
    }

    /// Number of cached pools
    pub fn len(&self) -> usize {
        self.pools.lock().expect("key pool registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split a comma-delimited keys string, dropping empties
fn parse_keys(keys_string: &str) -> Vec<String> {
    keys_string
        .split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Mask a key for display: first 4 + last 4 characters only
pub fn mask_key(key: &str) -> String {
    if key.len() < 8 {
        return "****".to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys() {
        assert_eq!(parse_keys("a, b ,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_keys(""), Vec::<String>::new());
        assert_eq!(parse_keys(",,x,"), vec!["x"]);
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-1234567890abcdef"), "sk-1...cdef");
        assert_eq!(mask_key("short"), "****");
    }

    #[test]
    fn test_empty_pool_returns_none() {
        let mut pool = KeyPool::new("");
        assert_eq!(pool.next_key(), None);
    }

    #[test]
    fn test_registry_reuses_pool() {
        let registry = KeyPoolRegistry::new();
        let pool = registry.get("cfg-1", "key-aaaa,key-bbbb");
        pool.lock().unwrap().mark_failed("key-aaaa", "HTTP 403");

        // Same id and keys: failure state survives
        let pool2 = registry.get("cfg-1", "key-aaaa,key-bbbb");
        assert_eq!(pool2.lock().unwrap().stats().failed, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_updates_on_key_change() {
        let registry = KeyPoolRegistry::new();
        registry.get("cfg-1", "key-aaaa");
        let pool = registry.get("cfg-1", "key-aaaa,key-bbbb");
        assert_eq!(pool.lock().unwrap().stats().total, 2);
    }
}
