pub mod error;
pub mod executor;
pub mod manager;

pub use error::{DispatchError, Result};
pub use executor::Executor;
pub use manager::{BatchPlan, TaskManager};
