use crate::kv::{KvStore, Result, StorageError};
use dmesh_types::Address;
use std::sync::Arc;
use tracing::debug;

const NODES_PREFIX: &str = "nodes:";
const PEER_PREFIX: &str = "peer:";

/// Node-availability store: which addresses currently serve a model, and the
/// network peer identifier behind each address. Kept fresh by an external
/// monitor; the dispatch engine only reads it.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn KvStore>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get_available_nodes(&self, model: &str) -> Result<Vec<Address>> {
        let key = format!("{}{}", NODES_PREFIX, model);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(Vec::new());
        };

        let hexes: Vec<String> = serde_json::from_str(&raw)?;
        let mut nodes = Vec::with_capacity(hexes.len());
        for hex in hexes {
            let address = Address::from_hex(&hex)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            nodes.push(address);
        }
        Ok(nodes)
    }

    pub async fn set_available_nodes(&self, model: &str, nodes: &[Address]) -> Result<()> {
        let key = format!("{}{}", NODES_PREFIX, model);
        let hexes: Vec<String> = nodes.iter().map(|n| n.to_hex()).collect();
        debug!(model, count = nodes.len(), "Updating available nodes");
        self.store.set(&key, &serde_json::to_string(&hexes)?).await
    }

    pub async fn get_peer_id(&self, address: &Address) -> Result<Option<String>> {
        let key = format!("{}{}", PEER_PREFIX, address.to_hex());
        self.store.get(&key).await
    }

    pub async fn set_peer_id(&self, address: &Address, peer_id: &str) -> Result<()> {
        let key = format!("{}{}", PEER_PREFIX, address.to_hex());
        self.store.set(&key, peer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    #[tokio::test]
    async fn test_available_nodes_roundtrip() {
        let registry = NodeRegistry::new(Arc::new(MemoryStore::new()));
        registry
            .set_available_nodes("model-a", &[addr(1), addr(2)])
            .await
            .unwrap();

        let nodes = registry.get_available_nodes("model-a").await.unwrap();
        assert_eq!(nodes, vec![addr(1), addr(2)]);
    }

    #[tokio::test]
    async fn test_unknown_model_is_empty() {
        let registry = NodeRegistry::new(Arc::new(MemoryStore::new()));
        assert!(registry
            .get_available_nodes("missing")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_peer_id_roundtrip() {
        let registry = NodeRegistry::new(Arc::new(MemoryStore::new()));
        assert_eq!(registry.get_peer_id(&addr(1)).await.unwrap(), None);

        registry.set_peer_id(&addr(1), "16Uiu2HAmPeer").await.unwrap();
        assert_eq!(
            registry.get_peer_id(&addr(1)).await.unwrap(),
            Some("16Uiu2HAmPeer".to_string())
        );
    }
}
