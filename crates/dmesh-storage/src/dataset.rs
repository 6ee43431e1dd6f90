use crate::kv::{KvStore, Result, StorageError};
use std::sync::Arc;
use tracing::debug;

const DATASET_PREFIX: &str = "dataset:";

/// Append-only entry store keyed by dataset id. The pipeline engine uses it
/// to persist final and failed batch outputs.
#[derive(Clone)]
pub struct DatasetStore {
    store: Arc<dyn KvStore>,
}

impl DatasetStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Append one entry, returning its sequence number.
    pub async fn append(&self, dataset_id: &str, entry: &serde_json::Value) -> Result<u64> {
        let len_key = format!("{}{}:len", DATASET_PREFIX, dataset_id);
        let seq = match self.store.get(&len_key).await? {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            None => 0,
        };

        let entry_key = format!("{}{}:{:010}", DATASET_PREFIX, dataset_id, seq);
        self.store
            .set(&entry_key, &serde_json::to_string(entry)?)
            .await?;
        self.store.set(&len_key, &(seq + 1).to_string()).await?;
        debug!(dataset_id, seq, "Dataset entry appended");
        Ok(seq)
    }

    /// All entries for a dataset in append order.
    pub async fn entries(&self, dataset_id: &str) -> Result<Vec<serde_json::Value>> {
        let prefix = format!("{}{}:", DATASET_PREFIX, dataset_id);
        let len_key = format!("{}len", prefix);

        let mut out = Vec::new();
        for (key, value) in self.store.scan(&prefix).await? {
            if key == len_key {
                continue;
            }
            out.push(serde_json::from_str(&value)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_preserves_order() {
        let datasets = DatasetStore::new(Arc::new(MemoryStore::new()));
        for i in 0..12 {
            let seq = datasets.append("d1", &json!({ "i": i })).await.unwrap();
            assert_eq!(seq, i);
        }

        let entries = datasets.entries("d1").await.unwrap();
        assert_eq!(entries.len(), 12);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry["i"], i as u64);
        }
    }

    #[tokio::test]
    async fn test_datasets_are_isolated() {
        let datasets = DatasetStore::new(Arc::new(MemoryStore::new()));
        datasets.append("a", &json!(1)).await.unwrap();
        datasets.append("b", &json!(2)).await.unwrap();

        assert_eq!(datasets.entries("a").await.unwrap(), vec![json!(1)]);
        assert_eq!(datasets.entries("b").await.unwrap(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_empty_dataset() {
        let datasets = DatasetStore::new(Arc::new(MemoryStore::new()));
        assert!(datasets.entries("none").await.unwrap().is_empty());
    }
}
