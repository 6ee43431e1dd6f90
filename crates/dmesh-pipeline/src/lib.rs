pub mod pipeline;
pub mod step;

pub use pipeline::{Pipeline, PipelineRecord, PipelineStatus};
pub use step::{Step, StepCallback, StepConfig, StepInput, StepOutput};

use dmesh_dispatch::DispatchError;
use dmesh_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline has no steps")]
    Empty,

    #[error("Step {step}: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("{callback} callback requires exactly one input key, step {step} declares {arity}")]
    InputKeyArity {
        callback: &'static str,
        step: String,
        arity: usize,
    },

    #[error("Callback error: {0}")]
    Callback(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
