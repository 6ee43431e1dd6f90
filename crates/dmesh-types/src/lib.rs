pub mod address;
pub mod envelope;
pub mod error;
pub mod id;
pub mod params;
pub mod task;

pub use address::Address;
pub use envelope::{FilterProof, ResultEnvelope, TaskEnvelope, WorkerOutput};
pub use error::{DmeshError, Result};
pub use id::{PipelineId, TaskId};
pub use params::{DispatchConfig, DispatchParams};
pub use task::{RetryLink, Task, TaskResult, TaskState, Workflow};

use chrono::Utc;

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
