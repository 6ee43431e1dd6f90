use crate::error::{DmeshError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Serialized membership filter keyed to a task's assigned node. Lets the
/// relay cheaply test candidate recipients without revealing the plaintext
/// address in the routed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterProof {
    /// Hex-encoded filter bit array.
    pub hex: String,
    /// Number of hash functions.
    pub hashes: u8,
}

impl FilterProof {
    pub fn empty() -> Self {
        Self {
            hex: String::new(),
            hashes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hex.is_empty()
    }
}

/// Outbound envelope published on the task topic. The transport carries it
/// as base64 JSON; authentication is entirely application-level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub filter: FilterProof,
    /// ECIES ciphertext of the workflow, hex-encoded.
    pub input: String,
    /// Network peer identifier of the picked node.
    pub peer_id: String,
    pub deadline_ns: i64,
    pub dataset_hash: Option<String>,
    pub public_key: String,
    pub private_key: String,
}

/// Inbound envelope decoded from the result topic. `body` is the 65-byte
/// recoverable signature followed by the ECIES ciphertext, hex-encoded.
/// `error` marks a worker-reported failure; the body then carries the error
/// text instead of a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: String,
    pub body: String,
    pub model: String,
    #[serde(default)]
    pub error: bool,
}

/// Decrypted plaintext of a successful result body: the worker's answer,
/// the echoed triggering input, and its self-reported execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub result: String,
    pub task_input: serde_json::Value,
    pub execution_time_ms: f64,
}

impl TaskEnvelope {
    pub fn to_payload(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| DmeshError::Serialization(e.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl ResultEnvelope {
    pub fn to_payload(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| DmeshError::Serialization(e.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
