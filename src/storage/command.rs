use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use url::{Origin, Url};

use super::event::{ObserverId, StorageObserver};
use super::ids::NamespaceId;
use super::types::{LocalStorageUsageInfo, MemoryUsage, SessionStorageUsageInfo};
use crate::errors::StorageError;

type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

/// Work sent from a [`StorageHandle`](super::StorageHandle) to the background sequence.
pub enum StorageCommand {
    // Namespaces
    CreateSessionNamespace {
        id: NamespaceId,
        persistent_id: String,
        reply: Reply<()>,
    },
    CloneSessionNamespace {
        existing_id: NamespaceId,
        new_id: NamespaceId,
        new_persistent_id: String,
        reply: Reply<()>,
    },
    DeleteSessionNamespace {
        id: NamespaceId,
        should_persist_data: bool,
        reply: Reply<()>,
    },

    // Areas
    Length {
        namespace_id: NamespaceId,
        origin: Origin,
        reply: Reply<usize>,
    },
    Key {
        namespace_id: NamespaceId,
        origin: Origin,
        index: usize,
        reply: Reply<Option<String>>,
    },
    GetItem {
        namespace_id: NamespaceId,
        origin: Origin,
        key: String,
        reply: Reply<Option<String>>,
    },
    SetItem {
        namespace_id: NamespaceId,
        origin: Origin,
        key: String,
        value: String,
        page_url: Url,
        reply: Reply<Option<String>>,
    },
    RemoveItem {
        namespace_id: NamespaceId,
        origin: Origin,
        key: String,
        page_url: Url,
        reply: Reply<Option<String>>,
    },
    Clear {
        namespace_id: NamespaceId,
        origin: Origin,
        page_url: Url,
        reply: Reply<bool>,
    },
    Snapshot {
        namespace_id: NamespaceId,
        origin: Origin,
        reply: Reply<BTreeMap<String, String>>,
    },

    // Observers
    AddObserver {
        observer: Arc<dyn StorageObserver>,
        reply: oneshot::Sender<ObserverId>,
    },
    RemoveObserver {
        id: ObserverId,
        reply: oneshot::Sender<bool>,
    },

    // Usage and deletion
    LocalStorageUsage {
        include_last_modified: bool,
        reply: oneshot::Sender<Vec<LocalStorageUsageInfo>>,
    },
    SessionStorageUsage {
        reply: oneshot::Sender<Vec<SessionStorageUsageInfo>>,
    },
    DeleteLocalStorage {
        origin: Origin,
        reply: Reply<()>,
    },
    DeleteSessionStorage {
        usage: SessionStorageUsageInfo,
        reply: Reply<()>,
    },

    // Flags and lifecycle
    SetForceKeepSessionState,
    SetSaveSessionStorageOnDisk {
        reply: Reply<()>,
    },
    ProtectPersistentSessionId {
        persistent_id: String,
    },
    /// Scavenging begins once the configured delay has passed.
    StartScavengingUnusedSessionStorage,
    Flush,
    PurgeMemory,
    MemoryUsage {
        reply: oneshot::Sender<MemoryUsage>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl StorageCommand {
    pub fn name(&self) -> &'static str {
        match self {
            StorageCommand::CreateSessionNamespace { .. } => "CreateSessionNamespace",
            StorageCommand::CloneSessionNamespace { .. } => "CloneSessionNamespace",
            StorageCommand::DeleteSessionNamespace { .. } => "DeleteSessionNamespace",
            StorageCommand::Length { .. } => "Length",
            StorageCommand::Key { .. } => "Key",
            StorageCommand::GetItem { .. } => "GetItem",
            StorageCommand::SetItem { .. } => "SetItem",
            StorageCommand::RemoveItem { .. } => "RemoveItem",
            StorageCommand::Clear { .. } => "Clear",
            StorageCommand::Snapshot { .. } => "Snapshot",
            StorageCommand::AddObserver { .. } => "AddObserver",
            StorageCommand::RemoveObserver { .. } => "RemoveObserver",
            StorageCommand::LocalStorageUsage { .. } => "LocalStorageUsage",
            StorageCommand::SessionStorageUsage { .. } => "SessionStorageUsage",
            StorageCommand::DeleteLocalStorage { .. } => "DeleteLocalStorage",
            StorageCommand::DeleteSessionStorage { .. } => "DeleteSessionStorage",
            StorageCommand::SetForceKeepSessionState => "SetForceKeepSessionState",
            StorageCommand::SetSaveSessionStorageOnDisk { .. } => "SetSaveSessionStorageOnDisk",
            StorageCommand::ProtectPersistentSessionId { .. } => "ProtectPersistentSessionId",
            StorageCommand::StartScavengingUnusedSessionStorage => "StartScavengingUnusedSessionStorage",
            StorageCommand::Flush => "Flush",
            StorageCommand::PurgeMemory => "PurgeMemory",
            StorageCommand::MemoryUsage { .. } => "MemoryUsage",
            StorageCommand::Shutdown { .. } => "Shutdown",
        }
    }
}

impl fmt::Debug for StorageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
