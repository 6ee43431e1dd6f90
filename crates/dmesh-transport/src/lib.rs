pub mod memory;

pub use memory::MemoryTransport;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Content topic carrying outbound task envelopes.
pub const TASK_TOPIC: &str = "/dmesh/0/task/proto";
/// Content topic carrying responder result envelopes.
pub const RESULT_TOPIC: &str = "/dmesh/0/result/proto";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Malformed content topic: {0}")]
    ContentTopic(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Content-addressed publish/subscribe boundary. Payloads are opaque base64
/// strings; the transport provides no sender identity, so authentication is
/// entirely application-level.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Drain pending messages on a topic.
    async fn get_messages(&self, topic: &str) -> Result<Vec<String>>;
}

/// Run a transport call with a fixed retry budget and fixed delay between
/// attempts, propagating the final error.
pub async fn with_retry<T, F, Fut>(retries: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(attempt, error = %e, "Transport call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn validate_topic(topic: &str) -> Result<()> {
    if !topic.starts_with('/') || topic.split('/').count() < 4 {
        return Err(TransportError::ContentTopic(topic.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_topic_validation() {
        assert!(validate_topic(TASK_TOPIC).is_ok());
        assert!(validate_topic(RESULT_TOPIC).is_ok());
        assert!(validate_topic("no-slash").is_err());
        assert!(validate_topic("/too/short").is_err());
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let failures = AtomicU32::new(2);
        let result = with_retry(3, Duration::from_millis(1), || async {
            if failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(TransportError::Connection("down".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_budget() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(2, Duration::from_millis(1), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Authentication("denied".into()))
        })
        .await;
        assert!(matches!(result, Err(TransportError::Authentication(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
