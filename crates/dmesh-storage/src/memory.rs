use crate::kv::{KvStore, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-memory key-value backend. Expired entries are dropped lazily on read.
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    return Ok(Some(entry.value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut matched: Vec<(String, String)> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("a", "1", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.get("a").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_prefix_sorted() {
        let store = MemoryStore::new();
        store.set("task:b", "2").await.unwrap();
        store.set("task:a", "1").await.unwrap();
        store.set("other:x", "9").await.unwrap();

        let matched = store.scan("task:").await.unwrap();
        assert_eq!(
            matched,
            vec![
                ("task:a".to_string(), "1".to_string()),
                ("task:b".to_string(), "2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_skips_expired() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("task:a", "1", Duration::from_millis(10))
            .await
            .unwrap();
        store.set("task:b", "2").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let matched = store.scan("task:").await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0, "task:b");
    }
}
