pub mod scoring;
pub mod selector;

pub use scoring::{NodeMetric, ScoreTracker};
pub use selector::{NodeSelector, SelectionError};

pub type Result<T> = std::result::Result<T, SelectionError>;
