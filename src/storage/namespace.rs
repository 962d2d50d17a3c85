use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use url::Origin;

use super::area::StorageArea;
use super::backing::{AreaBacking, LocalStoreHandle, NamespaceBacking, SessionStoreHandle};
use super::event::EventBus;
use super::ids::{NamespaceId, LOCAL_STORAGE_NAMESPACE_ID, LOCAL_STORAGE_PERSISTENT_ID};
use super::map::StorageMap;
use super::types::origin_key;
use crate::errors::StorageError;

/// A collection of areas keyed by origin.
///
/// The local namespace (id 0) is unique per context and never cloned. Session
/// namespaces carry a persistent id that names them on disk across restarts.
pub struct StorageNamespace {
    id: NamespaceId,
    persistent_id: String,
    backing: Option<NamespaceBacking>,
    areas: HashMap<Origin, StorageArea>,
    quota: usize,
    bus: Arc<EventBus>,
    is_shutdown: bool,
}

impl std::fmt::Debug for StorageNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNamespace")
            .field("id", &self.id)
            .field("persistent_id", &self.persistent_id)
            .field("areas", &self.areas.len())
            .finish_non_exhaustive()
    }
}

impl StorageNamespace {
    pub(crate) fn new_local(db: Option<LocalStoreHandle>, quota: usize, bus: Arc<EventBus>) -> Self {
        Self {
            id: LOCAL_STORAGE_NAMESPACE_ID,
            persistent_id: LOCAL_STORAGE_PERSISTENT_ID.to_string(),
            backing: db.map(NamespaceBacking::Local),
            areas: HashMap::new(),
            quota,
            bus,
            is_shutdown: false,
        }
    }

    pub(crate) fn new_session(
        id: NamespaceId,
        persistent_id: String,
        db: Option<SessionStoreHandle>,
        quota: usize,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            id,
            backing: db.map(|db| NamespaceBacking::Session { db, persistent_id: persistent_id.clone() }),
            persistent_id,
            areas: HashMap::new(),
            quota,
            bus,
            is_shutdown: false,
        }
    }

    pub fn id(&self) -> NamespaceId {
        self.id
    }

    pub fn persistent_id(&self) -> &str {
        &self.persistent_id
    }

    pub fn is_local(&self) -> bool {
        self.id.is_local()
    }

    pub fn is_backed(&self) -> bool {
        self.backing.is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Returns the area for `origin`, creating it on first use.
    pub fn open_area(&mut self, origin: &Origin) -> Result<&mut StorageArea, StorageError> {
        if !self.areas.contains_key(origin) {
            let backing = self.area_backing(origin)?;
            let mut area = StorageArea::new(self.id, origin.clone(), backing, self.quota, self.bus.clone());
            if self.is_shutdown {
                area.shutdown();
            }
            self.areas.insert(origin.clone(), area);
        }
        self.areas.get_mut(origin).ok_or(StorageError::OpaqueOrigin)
    }

    /// The area for `origin` if it has been opened.
    pub fn get_open_area(&self, origin: &Origin) -> Option<&StorageArea> {
        self.areas.get(origin)
    }

    pub fn get_open_area_mut(&mut self, origin: &Origin) -> Option<&mut StorageArea> {
        self.areas.get_mut(origin)
    }

    pub fn origins(&self) -> Vec<Origin> {
        self.areas.keys().cloned().collect()
    }

    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    /// Produces a session namespace whose areas share this namespace's maps.
    ///
    /// Pending changes are committed and the on-disk namespace is cloned first,
    /// so areas that were never opened here are still carried over on disk.
    pub(crate) fn clone_to(&mut self, new_id: NamespaceId, new_persistent_id: String) -> StorageNamespace {
        self.commit_dirty();

        let db = match &self.backing {
            Some(NamespaceBacking::Session { db, .. }) => Some(db.clone()),
            _ => None,
        };
        let mut disk_clone_failed = false;
        if let Some(db) = &db {
            if let Err(e) = db.clone_namespace(&self.persistent_id, &new_persistent_id) {
                warn!("failed to clone namespace {} on disk: {e:#}", self.persistent_id);
                disk_clone_failed = true;
            }
        }

        let mut clone = StorageNamespace::new_session(new_id, new_persistent_id, db, self.quota, self.bus.clone());
        for (origin, area) in self.areas.iter_mut() {
            // Opaque origins never make it into the table.
            let Ok(backing) = clone.area_backing(origin) else { continue };
            // The disk copy missed whatever the source still has pending.
            let dirty = area.has_uncommitted_changes();
            let mut copy = area.shallow_copy(new_id, backing);
            if disk_clone_failed || dirty {
                copy.schedule_full_commit();
            }
            clone.areas.insert(origin.clone(), copy);
        }

        debug!("cloned namespace {} into {} ({} areas)", self.id, new_id, clone.areas.len());
        clone
    }

    /// Wipes `origin` from memory and disk. The area, if open, is dropped.
    pub(crate) fn delete_origin(&mut self, origin: &Origin) {
        if let Some(mut area) = self.areas.remove(origin) {
            area.delete_origin();
            return;
        }
        match self.area_backing(origin) {
            Ok(Some(backing)) => {
                if let Err(e) = backing.delete() {
                    warn!("failed to delete {} from namespace {}: {e:#}", origin.ascii_serialization(), self.id);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("cannot delete origin from namespace {}: {e}", self.id),
        }
    }

    pub(crate) fn commit_dirty(&mut self) {
        for area in self.areas.values_mut() {
            area.commit_changes();
        }
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.areas.values().any(StorageArea::has_uncommitted_changes)
    }

    pub(crate) fn purge_memory(&mut self) {
        for area in self.areas.values_mut() {
            area.purge();
        }
    }

    /// Commits everything and stops accepting mutations.
    pub(crate) fn shutdown(&mut self) {
        for area in self.areas.values_mut() {
            area.shutdown();
        }
        self.is_shutdown = true;
    }

    /// Drops the store handle from the namespace and its areas. Used after shutdown.
    pub(crate) fn release_backing(&mut self) {
        for area in self.areas.values_mut() {
            area.release_backing();
        }
        self.backing = None;
    }

    pub(crate) fn maps(&self) -> impl Iterator<Item = &Arc<StorageMap>> {
        self.areas.values().map(StorageArea::map)
    }

    fn area_backing(&self, origin: &Origin) -> Result<Option<AreaBacking>, StorageError> {
        let key = origin_key(origin)?;
        Ok(self.backing.clone().map(|b| AreaBacking::new(b, key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backing::testing::FlakySessionStore;
    use crate::storage::backing::SessionStorageDatabase;
    use crate::storage::session::in_memory::InMemorySessionStorageDatabase;
    use url::Url;

    fn o(s: &str) -> Origin {
        Url::parse(s).expect("valid URL").origin()
    }

    fn page() -> Url {
        Url::parse("https://a.test/").unwrap()
    }

    fn session(id: i64, pid: &str, db: Option<SessionStoreHandle>) -> StorageNamespace {
        StorageNamespace::new_session(NamespaceId::new(id), pid.into(), db, 1 << 20, Arc::new(EventBus::new()))
    }

    #[test]
    fn areas_are_created_on_demand() {
        let mut ns = session(1, "p1", None);
        assert!(ns.get_open_area(&o("https://a.test")).is_none());

        ns.open_area(&o("https://a.test")).unwrap().set_item("k", "v", &page()).unwrap();
        assert_eq!(ns.area_count(), 1);

        // same origin, same area
        let area = ns.open_area(&o("https://a.test/other/path")).unwrap();
        assert_eq!(area.get_item("k").as_deref(), Some("v"));
        assert_eq!(ns.area_count(), 1);
    }

    #[test]
    fn opaque_origin_is_rejected() {
        let mut ns = session(1, "p1", None);
        let opaque = Url::parse("data:text/plain,x").unwrap().origin();
        assert!(matches!(ns.open_area(&opaque), Err(StorageError::OpaqueOrigin)));
        assert_eq!(ns.area_count(), 0);
    }

    #[test]
    fn local_namespace_uses_sentinel_ids() {
        let ns = StorageNamespace::new_local(None, 1024, Arc::new(EventBus::new()));
        assert!(ns.is_local());
        assert_eq!(ns.persistent_id(), LOCAL_STORAGE_PERSISTENT_ID);
    }

    #[test]
    fn clone_shares_maps_then_diverges() {
        let origin = o("https://a.test");
        let mut src = session(1, "p1", None);
        src.open_area(&origin).unwrap().set_item("k", "v", &page()).unwrap();

        let mut dst = src.clone_to(NamespaceId::new(2), "p2".into());
        assert_eq!(dst.id(), NamespaceId::new(2));
        assert_eq!(dst.persistent_id(), "p2");
        assert!(src.get_open_area(&origin).unwrap().shares_map_with(dst.get_open_area(&origin).unwrap()));

        src.open_area(&origin).unwrap().set_item("k", "changed", &page()).unwrap();
        assert_eq!(dst.open_area(&origin).unwrap().get_item("k").as_deref(), Some("v"));
        assert_eq!(src.open_area(&origin).unwrap().get_item("k").as_deref(), Some("changed"));
        assert!(!src.get_open_area(&origin).unwrap().shares_map_with(dst.get_open_area(&origin).unwrap()));
    }

    #[test]
    fn clone_copies_unopened_areas_on_disk() {
        let db = Arc::new(InMemorySessionStorageDatabase::new());
        let mut seed = crate::storage::backing::CommitBatch::default();
        seed.changed_values.insert("k".into(), Some("disk".into()));
        db.commit_area("p1", "https://cold.test", &seed).unwrap();

        let mut src = session(1, "p1", Some(db.clone()));
        src.open_area(&o("https://hot.test")).unwrap().set_item("h", "1", &page()).unwrap();

        let mut dst = src.clone_to(NamespaceId::new(2), "p2".into());
        assert_eq!(db.read_origins("p2").unwrap(), vec!["https://cold.test", "https://hot.test"]);
        assert_eq!(dst.open_area(&o("https://cold.test")).unwrap().get_item("k").as_deref(), Some("disk"));
        assert_eq!(dst.open_area(&o("https://hot.test")).unwrap().get_item("h").as_deref(), Some("1"));
    }

    #[test]
    fn delete_origin_drops_area_and_disk_data() {
        let db = Arc::new(InMemorySessionStorageDatabase::new());
        let mut ns = session(1, "p1", Some(db.clone()));
        ns.open_area(&o("https://a.test")).unwrap().set_item("k", "v", &page()).unwrap();
        ns.commit_dirty();
        assert!(!ns.has_uncommitted_changes());

        ns.delete_origin(&o("https://a.test"));
        assert_eq!(ns.area_count(), 0);
        assert!(db.read_area("p1", "https://a.test").unwrap().is_empty());
    }

    #[test]
    fn shutdown_applies_to_new_areas() {
        let mut ns = session(1, "p1", None);
        ns.shutdown();
        let area = ns.open_area(&o("https://late.test")).unwrap();
        assert!(matches!(area.set_item("k", "v", &page()), Err(StorageError::ShutDown)));
    }

    #[test]
    fn clone_rewrites_destination_when_disk_clone_fails() {
        let db = Arc::new(FlakySessionStore::default());
        let origin = o("https://a.test");
        let mut src = session(1, "p1", Some(db.clone()));
        src.open_area(&origin).unwrap().set_item("k", "v", &page()).unwrap();
        src.commit_dirty();

        db.set_failing(true);
        let mut dst = src.clone_to(NamespaceId::new(2), "p2".into());
        assert!(dst.has_uncommitted_changes());
        assert_eq!(db.inner.read_namespace_ids().unwrap(), vec!["p1"]);

        db.set_failing(false);
        dst.commit_dirty();
        assert_eq!(db.inner.read_area("p2", "https://a.test").unwrap()["k"], "v");
    }

    #[test]
    fn clone_carries_values_the_source_failed_to_commit() {
        let db = Arc::new(FlakySessionStore::default());
        let origin = o("https://a.test");
        let mut src = session(1, "p1", Some(db.clone()));
        src.open_area(&origin).unwrap().set_item("k", "v1", &page()).unwrap();
        src.commit_dirty();
        src.open_area(&origin).unwrap().set_item("k", "v2", &page()).unwrap();

        // the disk clone succeeds but copies the stale v1
        db.set_failing_commits(true);
        let mut dst = src.clone_to(NamespaceId::new(2), "p2".into());
        assert_eq!(db.inner.read_area("p2", "https://a.test").unwrap()["k"], "v1");

        db.set_failing_commits(false);
        dst.shutdown();
        assert_eq!(db.inner.read_area("p2", "https://a.test").unwrap()["k"], "v2");
        src.shutdown();
        assert_eq!(db.inner.read_area("p1", "https://a.test").unwrap()["k"], "v2");
    }

    #[test]
    fn released_namespace_drops_its_store() {
        let db = Arc::new(InMemorySessionStorageDatabase::new());
        let mut ns = session(1, "p1", Some(db.clone()));
        ns.open_area(&o("https://a.test")).unwrap().set_item("k", "v", &page()).unwrap();
        ns.shutdown();
        ns.release_backing();

        assert!(!ns.is_backed());
        assert_eq!(Arc::strong_count(&db), 1);
        assert_eq!(db.read_area("p1", "https://a.test").unwrap()["k"], "v");
    }
}
