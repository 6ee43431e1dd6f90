use crate::{validate_topic, PubSubTransport, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

/// In-process topic bus used by tests and local simulation. Messages are
/// drained by the first reader, matching the single-consumer relay model.
pub struct MemoryTransport {
    topics: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Pending message count without draining. Test helper.
    pub async fn pending(&self, topic: &str) -> usize {
        let topics = self.topics.read().await;
        topics.get(topic).map(|queue| queue.len()).unwrap_or(0)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryTransport {
    fn clone(&self) -> Self {
        Self {
            topics: Arc::clone(&self.topics),
        }
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        validate_topic(topic)?;
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .push(payload.to_string());
        trace!(topic, "Message enqueued");
        Ok(())
    }

    async fn get_messages(&self, topic: &str) -> Result<Vec<String>> {
        validate_topic(topic)?;
        let mut topics = self.topics.write().await;
        Ok(topics.remove(topic).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TASK_TOPIC;

    #[tokio::test]
    async fn test_publish_then_drain() {
        let bus = MemoryTransport::new();
        bus.publish(TASK_TOPIC, "one").await.unwrap();
        bus.publish(TASK_TOPIC, "two").await.unwrap();
        assert_eq!(bus.pending(TASK_TOPIC).await, 2);

        let messages = bus.get_messages(TASK_TOPIC).await.unwrap();
        assert_eq!(messages, vec!["one", "two"]);
        assert!(bus.get_messages(TASK_TOPIC).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = MemoryTransport::new();
        bus.publish("/dmesh/0/a/proto", "a").await.unwrap();
        bus.publish("/dmesh/0/b/proto", "b").await.unwrap();

        assert_eq!(bus.get_messages("/dmesh/0/a/proto").await.unwrap(), vec!["a"]);
        assert_eq!(bus.get_messages("/dmesh/0/b/proto").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_malformed_topic_rejected() {
        let bus = MemoryTransport::new();
        assert!(bus.publish("bad topic", "x").await.is_err());
    }
}
