use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info, warn};
use url::Origin;

use super::area::StorageArea;
use super::backing::{LocalStoreHandle, SessionStoreHandle};
use super::event::{EventBus, ObserverId, StorageObserver};
use super::ids::{self, NamespaceId, SessionIdAllocator, LOCAL_STORAGE_NAMESPACE_ID, LOCAL_STORAGE_PERSISTENT_ID};
use super::namespace::StorageNamespace;
use super::policy::{NoExtraRetention, SessionRetentionPolicy, SpecialStoragePolicy};
use super::scavenger::{ScavengePhase, Scavenger};
use super::types::{origin_key, LocalStorageUsageInfo, MemoryUsage, SessionStorageUsageInfo};
use crate::config::{self, ContextConfig};
use crate::errors::StorageError;

/// Root of the storage object graph for one profile.
///
/// Owns every namespace (the local one is created with the context), the
/// store handles, the observer table and the scavenger. All mutation takes
/// `&mut self`; in a running browser the context lives inside a
/// [`StorageWorker`](super::StorageWorker) and is reached through a
/// [`StorageHandle`](super::StorageHandle).
pub struct StorageContext {
    config: ContextConfig,
    namespaces: HashMap<NamespaceId, StorageNamespace>,
    persistent_to_namespace: HashMap<String, NamespaceId>,
    allocator: Arc<SessionIdAllocator>,
    bus: Arc<EventBus>,
    local_db: Option<LocalStoreHandle>,
    session_db: Option<SessionStoreHandle>,
    special_policy: Option<Arc<dyn SpecialStoragePolicy>>,
    retention: Arc<dyn SessionRetentionPolicy>,
    scavenger: Scavenger,
    force_keep_session_state: bool,
    is_shutdown: bool,
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("namespaces", &self.namespaces.len())
            .field("local_db", &self.local_db.is_some())
            .field("session_db", &self.session_db.is_some())
            .field("scavenger", &self.scavenger.phase())
            .field("is_shutdown", &self.is_shutdown)
            .finish_non_exhaustive()
    }
}

impl StorageContext {
    /// Builds a context from `config`, opening the local store in
    /// `localstorage_directory` when one is set.
    ///
    /// The session store stays closed until [`set_save_session_storage_on_disk`](Self::set_save_session_storage_on_disk).
    pub fn new(config: ContextConfig) -> Result<Self, StorageError> {
        config::validate(&config)?;
        let local_db = match &config.localstorage_directory {
            Some(dir) => Some(open_local_store(dir)?),
            None => None,
        };
        Ok(Self::assemble(config, local_db, None))
    }

    /// Builds a context on top of already opened stores. A session store given
    /// here is used right away.
    pub fn with_databases(
        config: ContextConfig,
        local_db: Option<LocalStoreHandle>,
        session_db: Option<SessionStoreHandle>,
    ) -> Self {
        Self::assemble(config, local_db, session_db)
    }

    fn assemble(config: ContextConfig, local_db: Option<LocalStoreHandle>, session_db: Option<SessionStoreHandle>) -> Self {
        let bus = Arc::new(EventBus::new());
        let local = StorageNamespace::new_local(local_db.clone(), config.per_area_quota, bus.clone());

        let mut namespaces = HashMap::new();
        namespaces.insert(LOCAL_STORAGE_NAMESPACE_ID, local);

        Self {
            config,
            namespaces,
            persistent_to_namespace: HashMap::new(),
            allocator: Arc::new(SessionIdAllocator::new()),
            bus,
            local_db,
            session_db,
            special_policy: None,
            retention: Arc::new(NoExtraRetention),
            scavenger: Scavenger::new(),
            force_keep_session_state: false,
            is_shutdown: false,
        }
    }

    pub fn with_special_storage_policy(mut self, policy: Arc<dyn SpecialStoragePolicy>) -> Self {
        self.special_policy = Some(policy);
        self
    }

    pub fn with_retention_policy(mut self, policy: Arc<dyn SessionRetentionPolicy>) -> Self {
        self.retention = policy;
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn localstorage_directory(&self) -> Option<&Path> {
        self.config.localstorage_directory.as_deref()
    }

    pub fn sessionstorage_directory(&self) -> Option<&Path> {
        self.config.sessionstorage_directory.as_deref()
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    // ---------- ids ----------

    /// The allocator, for handing to other threads.
    pub fn allocator(&self) -> Arc<SessionIdAllocator> {
        self.allocator.clone()
    }

    pub fn allocate_session_id(&self) -> NamespaceId {
        self.allocator.allocate()
    }

    pub fn allocate_persistent_session_id(&self) -> String {
        ids::allocate_persistent_session_id()
    }

    // ---------- namespaces ----------

    pub fn get_storage_namespace(&self, id: NamespaceId) -> Option<&StorageNamespace> {
        self.namespaces.get(&id)
    }

    pub fn get_storage_namespace_mut(&mut self, id: NamespaceId) -> Option<&mut StorageNamespace> {
        self.namespaces.get_mut(&id)
    }

    /// Ids of every namespace, local one included.
    pub fn namespace_ids(&self) -> Vec<NamespaceId> {
        let mut ids: Vec<_> = self.namespaces.keys().copied().collect();
        ids.sort();
        ids
    }

    /// The namespace currently registered under `persistent_id`.
    pub fn namespace_id_for(&self, persistent_id: &str) -> Option<NamespaceId> {
        self.persistent_to_namespace.get(persistent_id).copied()
    }

    /// Opens (or creates) the area for `origin` in namespace `id`.
    pub fn area_mut(&mut self, id: NamespaceId, origin: &Origin) -> Result<&mut StorageArea, StorageError> {
        self.namespaces
            .get_mut(&id)
            .ok_or(StorageError::NamespaceNotFound(id))?
            .open_area(origin)
    }

    pub fn create_session_namespace(&mut self, id: NamespaceId, persistent_id: &str) -> Result<(), StorageError> {
        self.ensure_running()?;
        if id.is_local() {
            error!("create_session_namespace: {id} is the local storage namespace");
            return Err(StorageError::InvalidNamespace(id));
        }
        if persistent_id == LOCAL_STORAGE_PERSISTENT_ID {
            error!("create_session_namespace: the empty persistent id belongs to local storage");
            return Err(StorageError::InvalidNamespace(id));
        }
        if self.namespaces.contains_key(&id) {
            error!("create_session_namespace: namespace {id} already exists");
            return Err(StorageError::NamespaceExists(id));
        }
        if let Some(existing) = self.namespace_id_for(persistent_id) {
            error!("create_session_namespace: persistent id {persistent_id} is held by namespace {existing}");
            return Err(StorageError::NamespaceExists(existing));
        }

        let namespace = StorageNamespace::new_session(
            id,
            persistent_id.to_string(),
            self.session_db.clone(),
            self.config.per_area_quota,
            self.bus.clone(),
        );
        self.namespaces.insert(id, namespace);
        self.persistent_to_namespace.insert(persistent_id.to_string(), id);
        debug!("created session namespace {id} ({persistent_id})");
        Ok(())
    }

    /// Registers `new_id` as a copy of `existing_id`. Areas share maps until one side writes.
    pub fn clone_session_namespace(
        &mut self,
        existing_id: NamespaceId,
        new_id: NamespaceId,
        new_persistent_id: &str,
    ) -> Result<(), StorageError> {
        self.ensure_running()?;
        if existing_id.is_local() || new_id.is_local() {
            error!("clone_session_namespace: the local storage namespace cannot be cloned");
            return Err(StorageError::InvalidNamespace(if existing_id.is_local() { existing_id } else { new_id }));
        }
        if new_persistent_id == LOCAL_STORAGE_PERSISTENT_ID {
            error!("clone_session_namespace: the empty persistent id belongs to local storage");
            return Err(StorageError::InvalidNamespace(new_id));
        }
        if self.namespaces.contains_key(&new_id) {
            error!("clone_session_namespace: namespace {new_id} already exists");
            return Err(StorageError::NamespaceExists(new_id));
        }
        if let Some(existing) = self.namespace_id_for(new_persistent_id) {
            error!("clone_session_namespace: persistent id {new_persistent_id} is held by namespace {existing}");
            return Err(StorageError::NamespaceExists(existing));
        }
        let Some(source) = self.namespaces.get_mut(&existing_id) else {
            error!("clone_session_namespace: source namespace {existing_id} does not exist");
            return Err(StorageError::NamespaceNotFound(existing_id));
        };

        let clone = source.clone_to(new_id, new_persistent_id.to_string());
        self.namespaces.insert(new_id, clone);
        self.persistent_to_namespace.insert(new_persistent_id.to_string(), new_id);
        Ok(())
    }

    /// Drops namespace `id`. With `should_persist_data` its contents are
    /// committed and kept on disk, otherwise they are deleted from the store
    /// right away, so a namespace re-created under the same persistent id starts empty.
    ///
    /// Deleting an unknown namespace does nothing.
    pub fn delete_session_namespace(&mut self, id: NamespaceId, should_persist_data: bool) -> Result<(), StorageError> {
        self.ensure_running()?;
        if id.is_local() {
            error!("delete_session_namespace: {id} is the local storage namespace");
            return Err(StorageError::InvalidNamespace(id));
        }
        let Some(mut namespace) = self.namespaces.remove(&id) else {
            debug!("delete_session_namespace: namespace {id} is already gone");
            return Ok(());
        };
        let persistent_id = namespace.persistent_id().to_string();
        self.persistent_to_namespace.remove(&persistent_id);

        if let Some(db) = &self.session_db {
            if should_persist_data {
                namespace.shutdown();
                if !self.scavenger.has_started() {
                    self.scavenger.protect(&persistent_id);
                }
            } else if let Err(e) = db.delete_namespace(&persistent_id) {
                // Left on disk; the next scavenge will find it.
                warn!("failed to delete session namespace {persistent_id}: {e:#}");
            }
        }
        debug!("deleted session namespace {id} ({persistent_id}), persist={should_persist_data}");
        Ok(())
    }

    // ---------- observers ----------

    pub fn add_event_observer(&self, observer: Arc<dyn StorageObserver>) -> ObserverId {
        self.bus.add(observer)
    }

    pub fn remove_event_observer(&self, id: ObserverId) -> bool {
        self.bus.remove(id)
    }

    // ---------- usage and deletion ----------

    /// Footprint of every origin in the local store. Empty without a local store.
    pub fn local_storage_usage(&mut self, include_last_modified: bool) -> Vec<LocalStorageUsageInfo> {
        let Some(db) = self.local_db.clone() else {
            return Vec::new();
        };
        if let Some(local) = self.namespaces.get_mut(&LOCAL_STORAGE_NAMESPACE_ID) {
            local.commit_dirty();
        }
        db.usage(include_last_modified).unwrap_or_else(|e| {
            warn!("failed to read local storage usage: {e:#}");
            Vec::new()
        })
    }

    /// Every (persistent id, origin) pair in the session store. Empty without a session store.
    pub fn session_storage_usage(&mut self) -> Vec<SessionStorageUsageInfo> {
        let Some(db) = self.session_db.clone() else {
            return Vec::new();
        };
        for namespace in self.namespaces.values_mut().filter(|ns| !ns.is_local()) {
            namespace.commit_dirty();
        }
        db.usage().unwrap_or_else(|e| {
            warn!("failed to read session storage usage: {e:#}");
            Vec::new()
        })
    }

    /// Wipes `origin` from local storage, in memory and on disk. Observers are not notified.
    pub fn delete_local_storage(&mut self, origin: &Origin) -> Result<(), StorageError> {
        self.ensure_running()?;
        origin_key(origin)?;
        if let Some(local) = self.namespaces.get_mut(&LOCAL_STORAGE_NAMESPACE_ID) {
            local.delete_origin(origin);
        }
        Ok(())
    }

    /// Wipes one (persistent id, origin) pair of session storage.
    pub fn delete_session_storage(&mut self, usage: &SessionStorageUsageInfo) -> Result<(), StorageError> {
        self.ensure_running()?;
        let key = origin_key(&usage.origin)?;

        if let Some(id) = self.namespace_id_for(&usage.persistent_namespace_id) {
            if let Some(namespace) = self.namespaces.get_mut(&id) {
                namespace.delete_origin(&usage.origin);
                return Ok(());
            }
        }
        if let Some(db) = &self.session_db {
            if let Err(e) = db.delete_area(&usage.persistent_namespace_id, &key) {
                warn!("failed to delete {key} from session {}: {e:#}", usage.persistent_namespace_id);
            }
        }
        Ok(())
    }

    // ---------- flags ----------

    pub fn force_keep_session_state(&self) -> bool {
        self.force_keep_session_state
    }

    /// Keeps session-only origins at shutdown.
    pub fn set_force_keep_session_state(&mut self) {
        self.force_keep_session_state = true;
    }

    pub fn is_saving_session_storage_on_disk(&self) -> bool {
        self.session_db.is_some()
    }

    /// Opens the session store in `sessionstorage_directory`. Only allowed
    /// before the first session namespace is created.
    pub fn set_save_session_storage_on_disk(&mut self) -> Result<(), StorageError> {
        self.ensure_running()?;
        if self.session_db.is_some() {
            return Ok(());
        }
        if self.namespaces.len() > 1 {
            error!("set_save_session_storage_on_disk: session namespaces already exist");
            return Err(StorageError::SessionStorageInUse);
        }
        let Some(dir) = self.config.sessionstorage_directory.clone() else {
            debug!("no session storage directory, session storage stays in memory");
            return Ok(());
        };
        self.session_db = Some(open_session_store(&dir)?);
        info!("saving session storage in {}", dir.display());
        Ok(())
    }

    // ---------- scavenging ----------

    /// Keeps `persistent_id` out of reach of the scavenger (session restore).
    pub fn protect_persistent_session_id(&mut self, persistent_id: &str) {
        self.scavenger.protect(persistent_id);
    }

    pub fn protected_persistent_session_ids(&self) -> &HashSet<String> {
        self.scavenger.protected_ids()
    }

    /// Begins scavenging. Returns `false` when there is no session store,
    /// after shutdown, or when scavenging already ran.
    pub fn start_scavenging_unused_session_storage(&mut self) -> bool {
        if self.is_shutdown || self.session_db.is_none() {
            return false;
        }
        let started = self.scavenger.start();
        if started {
            info!("scavenging unused session storage");
        }
        started
    }

    pub fn scavenger_phase(&self) -> ScavengePhase {
        self.scavenger.phase()
    }

    pub fn has_pending_scavenge_work(&self) -> bool {
        !self.is_shutdown && self.session_db.is_some() && self.scavenger.has_work()
    }

    /// Advances the scavenger by one step.
    pub fn scavenge_step(&mut self) -> ScavengePhase {
        let Some(db) = self.session_db.clone() else {
            return ScavengePhase::Idle;
        };
        if self.is_shutdown {
            return ScavengePhase::Idle;
        }
        let live = self.live_persistent_ids();
        let retention = self.retention.clone();
        let force_keep = self.force_keep_session_state;
        let retained = move |id: &str| retention.retain(id, force_keep);
        self.scavenger.step(&live, db.as_ref(), &retained)
    }

    /// Steps the scavenger until it has nothing left to do.
    pub fn scavenge_until_idle(&mut self) {
        while self.has_pending_scavenge_work() {
            self.scavenge_step();
        }
    }

    fn live_persistent_ids(&self) -> HashSet<String> {
        self.namespaces
            .values()
            .filter(|ns| !ns.is_local())
            .map(|ns| ns.persistent_id().to_string())
            .collect()
    }

    // ---------- lifecycle ----------

    /// Writes every dirty area to its store. Failures are logged and retried later.
    pub fn flush(&mut self) {
        if self.is_shutdown {
            return;
        }
        for namespace in self.namespaces.values_mut() {
            namespace.commit_dirty();
        }
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.namespaces.values().any(StorageNamespace::has_uncommitted_changes)
    }

    /// Drops in-memory copies that can be reloaded from disk.
    pub fn purge_memory(&mut self) {
        for namespace in self.namespaces.values_mut() {
            namespace.purge_memory();
        }
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut seen = HashSet::new();
        let mut usage = MemoryUsage {
            namespaces: self.namespaces.len(),
            ..Default::default()
        };
        for namespace in self.namespaces.values() {
            usage.areas += namespace.area_count();
            for map in namespace.maps() {
                if seen.insert(Arc::as_ptr(map)) {
                    usage.maps += 1;
                    usage.map_bytes += map.bytes_used();
                }
            }
        }
        usage
    }

    /// Commits everything, stops accepting mutations and, unless the session
    /// state is forcibly kept, wipes session-only origins from disk. The store
    /// handles are released afterwards. Idempotent.
    pub fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        self.is_shutdown = true;

        for namespace in self.namespaces.values_mut() {
            namespace.shutdown();
        }
        self.scavenger.finish();

        let has_session_only = self.special_policy.as_ref().is_some_and(|p| p.has_session_only_origins());
        if !self.force_keep_session_state && has_session_only {
            self.clear_session_only_origins();
        }

        for namespace in self.namespaces.values_mut() {
            namespace.release_backing();
        }
        self.local_db = None;
        self.session_db = None;
        info!("storage context shut down");
    }

    fn clear_session_only_origins(&self) {
        let Some(policy) = &self.special_policy else { return };
        let doomed = |origin: &Origin| policy.is_storage_session_only(origin) && !policy.is_storage_protected(origin);

        if let Some(db) = &self.local_db {
            match db.usage(false) {
                Ok(usage) => {
                    for info in usage.iter().filter(|info| doomed(&info.origin)) {
                        let key = info.origin.ascii_serialization();
                        if let Err(e) = db.delete_area(&key) {
                            warn!("failed to clear session-only origin {key}: {e:#}");
                        }
                    }
                }
                Err(e) => warn!("cannot enumerate local storage to clear session-only origins: {e:#}"),
            }
        }

        if let Some(db) = &self.session_db {
            match db.usage() {
                Ok(usage) => {
                    for info in usage.iter().filter(|info| doomed(&info.origin)) {
                        let key = info.origin.ascii_serialization();
                        if let Err(e) = db.delete_area(&info.persistent_namespace_id, &key) {
                            warn!("failed to clear session-only origin {key}: {e:#}");
                        }
                    }
                }
                Err(e) => warn!("cannot enumerate session storage to clear session-only origins: {e:#}"),
            }
        }
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.is_shutdown {
            debug!("storage context is shut down, rejecting call");
            return Err(StorageError::ShutDown);
        }
        Ok(())
    }
}

#[cfg(feature = "sqlite_storage")]
fn open_local_store(dir: &Path) -> Result<LocalStoreHandle, StorageError> {
    let db = super::local::sqlite_store::SqliteLocalStorageDatabase::in_directory(dir)?;
    Ok(Arc::new(db))
}

#[cfg(feature = "sqlite_storage")]
fn open_session_store(dir: &Path) -> Result<SessionStoreHandle, StorageError> {
    let db = super::session::sqlite_store::SqliteSessionStorageDatabase::in_directory(dir)?;
    Ok(Arc::new(db))
}

#[cfg(not(feature = "sqlite_storage"))]
fn open_local_store(dir: &Path) -> Result<LocalStoreHandle, StorageError> {
    Err(StorageError::Database(format!(
        "cannot open {}: built without the sqlite_storage feature",
        dir.display()
    )))
}

#[cfg(not(feature = "sqlite_storage"))]
fn open_session_store(dir: &Path) -> Result<SessionStoreHandle, StorageError> {
    Err(StorageError::Database(format!(
        "cannot open {}: built without the sqlite_storage feature",
        dir.display()
    )))
}
