use thiserror::Error;

#[derive(Error, Debug)]
pub enum DmeshError {
    #[error("Task publish failed: {0}")]
    TaskPublish(String),

    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Key generation failed: {0}")]
    Keygen(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Untrusted sender")]
    UntrustedSender,

    #[error("Task {0} deadline exceeded")]
    DeadlineExceeded(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node selection failed: {0}")]
    Selection(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl From<serde_json::Error> for DmeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl DmeshError {
    /// Capacity errors are transient; callers wait and retry instead of
    /// surfacing them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoCapacity(_))
    }
}

pub type Result<T> = std::result::Result<T, DmeshError>;
