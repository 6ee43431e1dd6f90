use crate::address::Address;
use crate::envelope::FilterProof;
use crate::id::{PipelineId, TaskId};
use serde::{Deserialize, Serialize};

/// Opaque unit-of-work payload. The dispatch core routes and authenticates
/// workflows but never interprets their contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow(serde_json::Value);

impl Workflow {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // serde_json::Value serialization cannot fail
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::from_slice(bytes)?))
    }
}

impl From<serde_json::Value> for Workflow {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Lifecycle of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Published,
    ResultAccepted,
    ResultRejected,
    Retrying,
    Expired,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ResultAccepted | Self::Expired)
    }
}

/// One dispatched unit of work with its own keypair, deadline, and assigned
/// node. Immutable after dispatch except for `processed` and retry chaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workflow: Workflow,
    /// Requested worker model identifiers; resolved to one concrete model
    /// per dispatch.
    pub models: Vec<String>,
    /// Exactly one address once dispatched.
    pub nodes: Vec<Address>,
    pub filter: FilterProof,
    pub public_key: String,
    pub private_key: String,
    pub deadline_ns: i64,
    pub created_ns: i64,
    pub pipeline_id: Option<PipelineId>,
    pub step_name: Option<String>,
    /// Terminal flag: once set, no further result for this id is accepted.
    pub processed: bool,
    /// Depth of this task in its retry chain; bounds republication.
    #[serde(default)]
    pub retries: u32,
    pub dataset_id: Option<String>,
}

impl Task {
    pub fn new(workflow: Workflow, models: Vec<String>) -> Self {
        Self {
            id: TaskId::from_bytes([0u8; 16]),
            workflow,
            models,
            nodes: Vec::new(),
            filter: FilterProof::empty(),
            public_key: String::new(),
            private_key: String::new(),
            deadline_ns: 0,
            created_ns: 0,
            pipeline_id: None,
            step_name: None,
            processed: false,
            retries: 0,
            dataset_id: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline_id: PipelineId, step_name: &str) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self.step_name = Some(step_name.to_string());
        self
    }

    pub fn with_dataset(mut self, dataset_id: &str) -> Self {
        self.dataset_id = Some(dataset_id.to_string());
        self
    }

    /// A result older than `return_deadline_ns` past the task deadline is
    /// never accepted, regardless of signature validity.
    pub fn is_expired(&self, now_ns: i64, return_deadline_ns: i64) -> bool {
        now_ns - self.deadline_ns > return_deadline_ns
    }

    pub fn assigned_node(&self) -> Option<&Address> {
        self.nodes.first()
    }
}

/// A verified result delivered for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: TaskId,
    /// Echo of the triggering input, used to re-correlate against batched
    /// requests.
    pub task_input: serde_json::Value,
    pub result: String,
    pub model: String,
    pub step_name: Option<String>,
}

/// Mapping from a failed task id to the id it was republished under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLink {
    pub new_task_id: TaskId,
}

impl RetryLink {
    pub const KEY_PREFIX: &'static str = "retry:";

    pub fn key_for(old_id: &TaskId) -> String {
        format!("{}{}", Self::KEY_PREFIX, old_id.to_hex())
    }
}
