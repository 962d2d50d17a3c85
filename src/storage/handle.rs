use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, oneshot};
use url::{Origin, Url};

use super::command::StorageCommand;
use super::event::{BroadcastObserver, ObserverId, StorageObserver, Subscription};
use super::ids::{self, NamespaceId, SessionIdAllocator};
use super::types::{LocalStorageUsageInfo, MemoryUsage, SessionStorageUsageInfo};
use crate::errors::StorageError;

/// Cheap, cloneable access to a running [`StorageWorker`](super::StorageWorker)
/// from any thread or task.
///
/// Id allocation happens right here, without a round trip. Everything else is
/// queued on the background sequence and answered over a oneshot channel.
#[derive(Clone)]
pub struct StorageHandle {
    cmd_tx: mpsc::Sender<StorageCommand>,
    allocator: Arc<SessionIdAllocator>,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("cmd_tx", &self.cmd_tx)
            .finish_non_exhaustive()
    }
}

impl StorageHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<StorageCommand>, allocator: Arc<SessionIdAllocator>) -> Self {
        Self { cmd_tx, allocator }
    }

    pub fn allocate_session_id(&self) -> NamespaceId {
        self.allocator.allocate()
    }

    pub fn allocate_persistent_session_id(&self) -> String {
        ids::allocate_persistent_session_id()
    }

    /// True once the worker has gone away.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    async fn send(&self, cmd: StorageCommand) -> Result<(), StorageError> {
        self.cmd_tx.send(cmd).await.map_err(|_| StorageError::ChannelClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> StorageCommand) -> Result<T, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| StorageError::ChannelClosed)
    }

    // ---------- namespaces ----------

    pub async fn create_session_namespace(&self, id: NamespaceId, persistent_id: &str) -> Result<(), StorageError> {
        let persistent_id = persistent_id.to_string();
        self.request(|reply| StorageCommand::CreateSessionNamespace { id, persistent_id, reply }).await?
    }

    pub async fn clone_session_namespace(
        &self,
        existing_id: NamespaceId,
        new_id: NamespaceId,
        new_persistent_id: &str,
    ) -> Result<(), StorageError> {
        let new_persistent_id = new_persistent_id.to_string();
        self.request(|reply| StorageCommand::CloneSessionNamespace { existing_id, new_id, new_persistent_id, reply })
            .await?
    }

    pub async fn delete_session_namespace(&self, id: NamespaceId, should_persist_data: bool) -> Result<(), StorageError> {
        self.request(|reply| StorageCommand::DeleteSessionNamespace { id, should_persist_data, reply }).await?
    }

    // ---------- areas ----------

    pub async fn length(&self, namespace_id: NamespaceId, origin: &Origin) -> Result<usize, StorageError> {
        let origin = origin.clone();
        self.request(|reply| StorageCommand::Length { namespace_id, origin, reply }).await?
    }

    pub async fn key(&self, namespace_id: NamespaceId, origin: &Origin, index: usize) -> Result<Option<String>, StorageError> {
        let origin = origin.clone();
        self.request(|reply| StorageCommand::Key { namespace_id, origin, index, reply }).await?
    }

    pub async fn get_item(&self, namespace_id: NamespaceId, origin: &Origin, key: &str) -> Result<Option<String>, StorageError> {
        let (origin, key) = (origin.clone(), key.to_string());
        self.request(|reply| StorageCommand::GetItem { namespace_id, origin, key, reply }).await?
    }

    /// Returns the previous value.
    pub async fn set_item(
        &self,
        namespace_id: NamespaceId,
        origin: &Origin,
        key: &str,
        value: &str,
        page_url: &Url,
    ) -> Result<Option<String>, StorageError> {
        let (origin, key, value, page_url) = (origin.clone(), key.to_string(), value.to_string(), page_url.clone());
        self.request(|reply| StorageCommand::SetItem { namespace_id, origin, key, value, page_url, reply })
            .await?
    }

    pub async fn remove_item(
        &self,
        namespace_id: NamespaceId,
        origin: &Origin,
        key: &str,
        page_url: &Url,
    ) -> Result<Option<String>, StorageError> {
        let (origin, key, page_url) = (origin.clone(), key.to_string(), page_url.clone());
        self.request(|reply| StorageCommand::RemoveItem { namespace_id, origin, key, page_url, reply }).await?
    }

    pub async fn clear(&self, namespace_id: NamespaceId, origin: &Origin, page_url: &Url) -> Result<bool, StorageError> {
        let (origin, page_url) = (origin.clone(), page_url.clone());
        self.request(|reply| StorageCommand::Clear { namespace_id, origin, page_url, reply }).await?
    }

    pub async fn snapshot(&self, namespace_id: NamespaceId, origin: &Origin) -> Result<BTreeMap<String, String>, StorageError> {
        let origin = origin.clone();
        self.request(|reply| StorageCommand::Snapshot { namespace_id, origin, reply }).await?
    }

    // ---------- observers ----------

    pub async fn add_event_observer(&self, observer: Arc<dyn StorageObserver>) -> Result<ObserverId, StorageError> {
        self.request(|reply| StorageCommand::AddObserver { observer, reply }).await
    }

    pub async fn remove_event_observer(&self, id: ObserverId) -> Result<bool, StorageError> {
        self.request(|reply| StorageCommand::RemoveObserver { id, reply }).await
    }

    /// Registers a broadcast observer and returns a receiver for its events.
    pub async fn subscribe(&self, capacity: usize) -> Result<(ObserverId, Subscription), StorageError> {
        let observer = Arc::new(BroadcastObserver::new(capacity));
        let rx = observer.subscribe();
        let id = self.add_event_observer(observer).await?;
        Ok((id, rx))
    }

    // ---------- usage and deletion ----------

    pub async fn local_storage_usage(&self, include_last_modified: bool) -> Result<Vec<LocalStorageUsageInfo>, StorageError> {
        self.request(|reply| StorageCommand::LocalStorageUsage { include_last_modified, reply }).await
    }

    pub async fn session_storage_usage(&self) -> Result<Vec<SessionStorageUsageInfo>, StorageError> {
        self.request(|reply| StorageCommand::SessionStorageUsage { reply }).await
    }

    pub async fn delete_local_storage(&self, origin: &Origin) -> Result<(), StorageError> {
        let origin = origin.clone();
        self.request(|reply| StorageCommand::DeleteLocalStorage { origin, reply }).await?
    }

    pub async fn delete_session_storage(&self, usage: &SessionStorageUsageInfo) -> Result<(), StorageError> {
        let usage = usage.clone();
        self.request(|reply| StorageCommand::DeleteSessionStorage { usage, reply }).await?
    }

    // ---------- flags and lifecycle ----------

    pub async fn set_force_keep_session_state(&self) -> Result<(), StorageError> {
        self.send(StorageCommand::SetForceKeepSessionState).await
    }

    pub async fn set_save_session_storage_on_disk(&self) -> Result<(), StorageError> {
        self.request(|reply| StorageCommand::SetSaveSessionStorageOnDisk { reply }).await?
    }

    pub async fn protect_persistent_session_id(&self, persistent_id: &str) -> Result<(), StorageError> {
        let persistent_id = persistent_id.to_string();
        self.send(StorageCommand::ProtectPersistentSessionId { persistent_id }).await
    }

    pub async fn start_scavenging_unused_session_storage(&self) -> Result<(), StorageError> {
        self.send(StorageCommand::StartScavengingUnusedSessionStorage).await
    }

    /// Asks the worker to commit dirty areas. Never waits; when the queue is
    /// full the periodic commit picks the changes up instead.
    pub fn flush(&self) {
        if let Err(e) = self.cmd_tx.try_send(StorageCommand::Flush) {
            debug!("flush request dropped: {e}");
        }
    }

    pub async fn purge_memory(&self) -> Result<(), StorageError> {
        self.send(StorageCommand::PurgeMemory).await
    }

    pub async fn memory_usage(&self) -> Result<MemoryUsage, StorageError> {
        self.request(|reply| StorageCommand::MemoryUsage { reply }).await
    }

    /// Commits everything and stops accepting mutations. Resolves once the worker is done.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.request(|reply| StorageCommand::Shutdown { reply }).await
    }
}
