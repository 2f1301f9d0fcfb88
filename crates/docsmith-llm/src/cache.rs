use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsmith_core::{GatewayResult, TokenUsage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A stored response for one (model, normalized prompt) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key the entry was stored under.
    pub key: String,
    /// Cached completion text.
    pub content: String,
    /// Usage of the call that produced `content`.
    pub usage: TokenUsage,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(key: impl Into<String>, content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            key: key.into(),
            content: content.into(),
            usage,
            stored_at: Utc::now(),
        }
    }
}

/// Lowercases, collapses whitespace runs to one space, and trims.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key: `model + ":" + normalize(text)`.
pub fn key_for(model: &str, text: &str) -> String {
    format!("{model}:{}", normalize(text))
}

/// Trait for response cache backends.
///
/// Operations are fallible so that remote or on-disk stores can report
/// failures; the invocation engine logs them and carries on as if the entry
/// were missing.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Looks up `key`. `Ok(None)` is a plain miss.
    async fn get(&self, key: &str) -> GatewayResult<Option<CacheEntry>>;

    /// Stores `entry` under `key`. On concurrent writes the last one wins.
    async fn set(&self, key: &str, entry: CacheEntry) -> GatewayResult<()>;

    /// Removes every entry.
    async fn clear(&self) -> GatewayResult<()>;

    /// Number of stored entries.
    async fn len(&self) -> GatewayResult<usize>;

    /// Whether the cache holds no entries.
    async fn is_empty(&self) -> GatewayResult<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Process-local cache. Entries live until [`ResponseCache::clear`].
pub struct InMemoryResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryResponseCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> GatewayResult<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> GatewayResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn clear(&self) -> GatewayResult<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> GatewayResult<usize> {
        Ok(self.entries.read().await.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn normalize_collapses_and_lowercases() {
        assert_eq!(normalize("  Hello  World  "), "hello world");
        assert_eq!(normalize("Tabs\tand\nnewlines"), "tabs and newlines");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn key_format() {
        assert_eq!(key_for("model-x", "Hello World"), "model-x:hello world");
        assert_eq!(
            key_for("model-x", "hello   WORLD\n"),
            key_for("model-x", "Hello World")
        );
        assert_ne!(key_for("model-y", "Hello World"), key_for("model-x", "Hello World"));
    }

    #[tokio::test]
    async fn set_get_clear() {
        let cache = InMemoryResponseCache::new();
        let key = key_for("m", "prompt");
        assert!(cache.get(&key).await.unwrap().is_none());

        cache
            .set(&key, CacheEntry::new(&key, "answer", TokenUsage::new(1, 2)))
            .await
            .unwrap();
        let hit = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.content, "answer");
        assert_eq!(hit.usage.total_tokens, 3);
        assert_eq!(cache.len().await.unwrap(), 1);

        cache.clear().await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 0);
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_writers_last_write_wins_without_corruption() {
        let cache = Arc::new(InMemoryResponseCache::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("m:prompt {}", i % 4);
                cache
                    .set(&key, CacheEntry::new(&key, format!("v{i}"), TokenUsage::default()))
                    .await
                    .unwrap();
                cache.get(&key).await.unwrap().is_some()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(cache.len().await.unwrap(), 4);
    }
}
