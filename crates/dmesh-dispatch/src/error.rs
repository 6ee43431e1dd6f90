use dmesh_crypto::CryptoError;
use dmesh_select::SelectionError;
use dmesh_storage::StorageError;
use dmesh_transport::TransportError;
use dmesh_types::DmeshError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Transient scarcity: no nodes (or not enough aggregate throughput)
    /// for the requested models. Callers wait and retry.
    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Task publish failed: {0}")]
    TaskPublish(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<dmesh_types::DmeshError> for DispatchError {
    fn from(e: DmeshError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<DispatchError> for DmeshError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NoCapacity(msg) => DmeshError::NoCapacity(msg),
            DispatchError::TaskPublish(msg) => DmeshError::TaskPublish(msg),
            DispatchError::Crypto(CryptoError::UntrustedSender) => DmeshError::UntrustedSender,
            DispatchError::Crypto(inner) => DmeshError::Crypto(inner.to_string()),
            DispatchError::Selection(inner) => DmeshError::Selection(inner.to_string()),
            DispatchError::Storage(inner) => DmeshError::Database(inner.to_string()),
            DispatchError::Transport(inner) => DmeshError::Transport(inner.to_string()),
            DispatchError::Serialization(msg) => DmeshError::Serialization(msg),
            DispatchError::Cancelled => DmeshError::InvalidParameter("cancelled".into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
