//! Cache store capability and the in-memory store

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache payload error: {0}")]
    Serialization(String),
}

/// Key/value store with per-entry TTL
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, payload: String, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete every key matching a glob (`*` wildcard), returning the count
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError>;

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Stored value with its expiry bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub payload: String,
    pub ttl: Duration,
    pub created_at: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// Glob match supporting `*` only
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = key.strip_prefix(first) else {
        return false;
    };

    let last = rest[rest.len() - 1];
    for part in &rest[..rest.len() - 1] {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}

/// In-process store; TTL is checked on read and expired entries are purged lazily
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Make room for one entry: drop expired entries, then the oldest tenth
    fn maybe_evict(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) {
        if entries.len() < max_entries {
            return;
        }

        let now = Instant::now();
        entries.retain(|_, e| !e.is_expired(now));
        if entries.len() < max_entries {
            return;
        }

        let evict_count = (max_entries / 10).max(1);
        let mut by_age: Vec<(String, Instant)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.created_at))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);

        for (key, _) in by_age.into_iter().take(evict_count) {
            entries.remove(&key);
        }
        debug!("Evicted {} cache entries", evict_count);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.payload.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: purge under the write lock
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, payload: String, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) {
            Self::maybe_evict(&mut entries, self.max_entries);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                payload,
                ttl,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !glob_match(pattern, key));
        Ok(before - entries.len())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .values()
            .filter(|e| !e.is_expired(now) && glob_match(pattern, &e.key))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("retrieval:doc:42:*", "retrieval:doc:42:abc"));
        assert!(!glob_match("retrieval:doc:42:*", "retrieval:doc:420:abc"));
        assert!(glob_match("*:doc:42:*", "response:doc:42:abc"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("docmeta:42", "docmeta:42"));
        assert!(!glob_match("docmeta:42", "docmeta:421"));
        assert!(glob_match("a*b*c", "a-x-b-y-c"));
        assert!(!glob_match("a*b*c", "a-x-c-y-b"));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryCacheStore::new(100);
        store
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryCacheStore::new(100);
        store
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_pattern() {
        let store = MemoryCacheStore::new(100);
        let ttl = Duration::from_secs(60);
        for key in ["retrieval:doc:42:a", "response:doc:42:b", "retrieval:doc:7:c"] {
            store.set(key, "x".to_string(), ttl).await.unwrap();
        }

        assert_eq!(store.delete_pattern("*:doc:42:*").await.unwrap(), 2);
        assert_eq!(store.keys("*").await.unwrap(), vec!["retrieval:doc:7:c"]);
    }

    #[tokio::test]
    async fn test_eviction_bounds_size() {
        let store = MemoryCacheStore::new(10);
        for i in 0..25 {
            store
                .set(&format!("k{}", i), "x".to_string(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert!(store.len().await <= 10);
    }
}
