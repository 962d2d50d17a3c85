use crate::config::ContextConfigError;
use crate::storage::NamespaceId;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage context has been shut down")]
    ShutDown,

    #[error("Namespace {0} already exists")]
    NamespaceExists(NamespaceId),

    #[error("Namespace {0} not found")]
    NamespaceNotFound(NamespaceId),

    #[error("Namespace {0} cannot be used as a session namespace")]
    InvalidNamespace(NamespaceId),

    #[error("Quota of {quota} bytes exceeded for {origin}")]
    QuotaExceeded { origin: String, quota: usize },

    #[error("Opaque origins cannot hold storage")]
    OpaqueOrigin,

    #[error("Session storage is already in use")]
    SessionStorageInUse,

    #[error("Storage command channel closed")]
    ChannelClosed,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ContextConfigError),
}

impl From<anyhow::Error> for StorageError {
    fn from(e: anyhow::Error) -> Self {
        StorageError::Database(format!("{e:#}"))
    }
}
