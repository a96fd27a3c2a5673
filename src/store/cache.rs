use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::model::WorkspaceId;

/// Key-value backend with TTL and atomic increment.
/// A `ttl_seconds` of 0 keeps the entry until it is deleted.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value, ttl_seconds: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn incr(&self, key: &str) -> Result<i64>;
    /// Delete every key starting with `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
    /// Drop entries whose TTL has passed. Backends that expire on their own return 0.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process cache backend
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(ttl_seconds: u64) -> Option<Instant> {
        (ttl_seconds > 0).then(|| Instant::now() + Duration::from_secs(ttl_seconds))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(Instant::now()) => {
                    return Ok(Some(entry.value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it lazily
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(Instant::now()))
        {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl_seconds: u64) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Self::expiry(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: Value::from(0),
                expires_at: None,
            });
        if entry.is_expired(now) {
            entry.value = Value::from(0);
            entry.expires_at = None;
        }
        let current = entry
            .value
            .as_i64()
            .with_context(|| format!("Cache key '{}' does not hold an integer", key))?;
        let next = current + 1;
        entry.value = Value::from(next);
        Ok(next)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }
}

/// Typed access to a shared cache backend
#[derive(Clone)]
pub struct CacheFacade {
    backend: Arc<dyn CacheBackend>,
}

impl CacheFacade {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    /// `{namespace}:{workspace_id}:{hash}`
    pub fn generate_key(namespace: &str, workspace_id: WorkspaceId, hash: &str) -> String {
        format!("{}:{}:{}", namespace, workspace_id, hash)
    }

    /// Prefix shared by every key of a namespace within one workspace
    pub fn workspace_prefix(namespace: &str, workspace_id: WorkspaceId) -> String {
        format!("{}:{}:", namespace, workspace_id)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(value) => {
                let typed = serde_json::from_value(value)
                    .with_context(|| format!("Cached value under '{}' has an unexpected shape", key))?;
                Ok(Some(typed))
            }
            None => Ok(None),
        }
    }

    /// The value is serialized completely before it is handed to the backend,
    /// so readers only ever observe the old value or the whole new one.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_seconds: u64) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize cache value for '{}'", key))?;
        self.backend.set(key, value, ttl_seconds).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(key).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.backend.incr(key).await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.backend.delete_prefix(prefix).await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.backend.purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        total: usize,
        names: Vec<String>,
    }

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = CacheFacade::in_memory();
        let payload = Payload {
            total: 2,
            names: vec!["a".to_string(), "b".to_string()],
        };

        cache.set("k1", &payload, 0).await.unwrap();
        assert!(cache.exists("k1").await.unwrap());

        let cached: Option<Payload> = cache.get("k1").await.unwrap();
        assert_eq!(cached, Some(payload));

        assert!(cache.delete("k1").await.unwrap());
        assert!(!cache.exists("k1").await.unwrap());
        assert!(!cache.delete("k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_incr() {
        let cache = CacheFacade::in_memory();
        assert_eq!(cache.incr("counter").await.unwrap(), 1);
        assert_eq!(cache.incr("counter").await.unwrap(), 2);

        cache.set("text", "hello", 0).await.unwrap();
        assert!(cache.incr("text").await.is_err());
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let backend = Arc::new(MemoryCache::new());
        backend
            .entries
            .write()
            .await
            .insert(
                "old".to_string(),
                CacheEntry {
                    value: Value::from(1),
                    expires_at: Some(Instant::now() - Duration::from_secs(1)),
                },
            );
        backend.set("fresh", Value::from(2), 60).await.unwrap();
        backend.set("forever", Value::from(3), 0).await.unwrap();

        assert_eq!(backend.get("old").await.unwrap(), None);
        assert_eq!(backend.get("fresh").await.unwrap(), Some(Value::from(2)));
        assert_eq!(backend.purge_expired().await.unwrap(), 0);
        assert_eq!(backend.len().await, 2);
    }

    #[tokio::test]
    async fn test_purge_drops_entries_nobody_reads() {
        let backend = Arc::new(MemoryCache::new());
        for key in ["checkpoint-a", "checkpoint-b"] {
            backend.entries.write().await.insert(
                key.to_string(),
                CacheEntry {
                    value: Value::from(1),
                    expires_at: Some(Instant::now() - Duration::from_secs(1)),
                },
            );
        }
        backend.set("live", Value::from(2), 60).await.unwrap();

        let cache = CacheFacade::new(backend.clone());
        assert_eq!(cache.purge_expired().await.unwrap(), 2);
        assert_eq!(backend.len().await, 1);
        assert!(cache.exists("live").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_prefix_is_scoped() {
        let cache = CacheFacade::in_memory();
        let key_a = CacheFacade::generate_key("stats", 1, "a");
        let key_b = CacheFacade::generate_key("stats", 1, "b");
        let other = CacheFacade::generate_key("stats", 11, "a");
        for key in [&key_a, &key_b, &other] {
            cache.set(key, &1, 0).await.unwrap();
        }

        let removed = cache
            .delete_prefix(&CacheFacade::workspace_prefix("stats", 1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(cache.exists(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_an_error() {
        let cache = CacheFacade::in_memory();
        cache.set("k", &"not a payload", 0).await.unwrap();
        let result: Result<Option<Payload>> = cache.get("k").await;
        assert!(result.is_err());
    }
}
