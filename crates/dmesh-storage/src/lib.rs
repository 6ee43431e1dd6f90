pub mod dataset;
pub mod kv;
pub mod memory;
pub mod registry;

pub use dataset::DatasetStore;
pub use kv::{KvStore, Result, StorageError};
pub use memory::MemoryStore;
pub use registry::NodeRegistry;
