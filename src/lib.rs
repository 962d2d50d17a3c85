pub mod config;
pub mod errors;
pub mod storage;

pub use config::{ContextConfig, ContextConfigError};
pub use errors::StorageError;
pub use storage::{StorageContext, StorageHandle, StorageWorker};
