use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use url::{Origin, Url};

use super::backing::{AreaBacking, CommitBatch};
use super::event::{AreaId, EventBus};
use super::ids::NamespaceId;
use super::map::StorageMap;
use crate::errors::StorageError;

/// Storage container for one origin inside one namespace (DOM's `Storage`).
///
/// An area points at exactly one [`StorageMap`]. After a namespace clone the
/// map may be shared with areas in other namespaces; every write path goes
/// through [`Arc::make_mut`], which clones a shared map and rebinds this area
/// to the copy before mutating it.
pub struct StorageArea {
    id: AreaId,
    map: Arc<StorageMap>,
    backing: Option<AreaBacking>,
    commit_batch: Option<CommitBatch>,
    is_initial_import_done: bool,
    is_shutdown: bool,
    quota: usize,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for StorageArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageArea")
            .field("id", &self.id)
            .field("backed", &self.backing.is_some())
            .field("dirty", &self.has_uncommitted_changes())
            .field("shutdown", &self.is_shutdown)
            .finish_non_exhaustive()
    }
}

impl StorageArea {
    pub(crate) fn new(
        namespace_id: NamespaceId,
        origin: Origin,
        backing: Option<AreaBacking>,
        quota: usize,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            id: AreaId { namespace_id, origin },
            map: Arc::new(StorageMap::new()),
            // Nothing to import without a backing store.
            is_initial_import_done: backing.is_none(),
            backing,
            commit_batch: None,
            is_shutdown: false,
            quota,
            bus,
        }
    }

    pub fn id(&self) -> &AreaId {
        &self.id
    }

    pub fn namespace_id(&self) -> NamespaceId {
        self.id.namespace_id
    }

    pub fn origin(&self) -> &Origin {
        &self.id.origin
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub fn is_backed(&self) -> bool {
        self.backing.is_some()
    }

    pub fn is_initial_import_done(&self) -> bool {
        self.is_initial_import_done
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.commit_batch.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// True when both areas currently point at the same map object.
    pub fn shares_map_with(&self, other: &StorageArea) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }

    /// Number of areas (across all namespaces) pointing at this area's map.
    pub fn map_ref_count(&self) -> usize {
        Arc::strong_count(&self.map)
    }

    pub(crate) fn map(&self) -> &Arc<StorageMap> {
        &self.map
    }

    pub fn length(&mut self) -> usize {
        self.import_if_needed();
        self.map.len()
    }

    pub fn key(&mut self, index: usize) -> Option<String> {
        self.import_if_needed();
        self.map.key(index).map(str::to_string)
    }

    pub fn keys(&mut self) -> Vec<String> {
        self.import_if_needed();
        self.map.keys().map(str::to_string).collect()
    }

    pub fn get_item(&mut self, key: &str) -> Option<String> {
        self.import_if_needed();
        self.map.get_item(key).map(str::to_string)
    }

    pub fn snapshot(&mut self) -> BTreeMap<String, String> {
        self.import_if_needed();
        self.map.to_btree()
    }

    /// Stores `value` under `key` and returns the previous value.
    ///
    /// Writing the value already stored changes nothing and fires no event.
    pub fn set_item(&mut self, key: &str, value: &str, page_url: &Url) -> Result<Option<String>, StorageError> {
        if self.is_shutdown {
            return Err(StorageError::ShutDown);
        }
        self.import_if_needed();

        if self.map.get_item(key) == Some(value) {
            return Ok(Some(value.to_string()));
        }
        if self.map.bytes_after_set(key, value) > self.quota {
            return Err(StorageError::QuotaExceeded {
                origin: self.id.origin.ascii_serialization(),
                quota: self.quota,
            });
        }

        let outcome = Arc::make_mut(&mut self.map).set_item(key, value);
        if self.backing.is_some() {
            self.batch().changed_values.insert(key.to_string(), Some(value.to_string()));
        }

        self.bus.notify_item_set(&self.id, key, value, outcome.old_value.as_deref(), page_url);
        Ok(outcome.old_value)
    }

    /// Removes `key` and returns its previous value. Absent keys are a silent no-op.
    pub fn remove_item(&mut self, key: &str, page_url: &Url) -> Result<Option<String>, StorageError> {
        if self.is_shutdown {
            return Err(StorageError::ShutDown);
        }
        self.import_if_needed();

        if self.map.get_item(key).is_none() {
            return Ok(None);
        }
        let old = Arc::make_mut(&mut self.map).remove_item(key);
        if self.backing.is_some() {
            self.batch().changed_values.insert(key.to_string(), None);
        }

        if let Some(old) = &old {
            self.bus.notify_item_removed(&self.id, key, old, page_url);
        }
        Ok(old)
    }

    /// Empties the area. Returns `false` (and fires nothing) when it was already empty.
    pub fn clear(&mut self, page_url: &Url) -> Result<bool, StorageError> {
        if self.is_shutdown {
            return Err(StorageError::ShutDown);
        }
        if !self.reset_map() {
            return Ok(false);
        }
        self.bus.notify_area_cleared(&self.id, page_url);
        Ok(true)
    }

    /// Wipes the origin's data, in memory and on disk, without notifying observers.
    pub(crate) fn delete_origin(&mut self) {
        if self.is_shutdown {
            return;
        }
        self.map = Arc::new(StorageMap::new());
        self.is_initial_import_done = true;
        self.commit_batch = None;

        let Some(backing) = &self.backing else { return };
        if let Err(e) = backing.delete() {
            warn!("failed to delete {:?}, will retry on next commit: {e:#}", self.id);
            self.batch().clear_all_first = true;
        }
    }

    // Rebinds to a fresh map instead of mutating; a shared map stays untouched.
    fn reset_map(&mut self) -> bool {
        self.import_if_needed();
        if self.map.is_empty() {
            return false;
        }
        self.map = Arc::new(StorageMap::new());
        if self.backing.is_some() {
            let batch = self.batch();
            batch.clear_all_first = true;
            batch.changed_values.clear();
        }
        true
    }

    /// Drops the in-memory copy; the next access reloads it from the store.
    ///
    /// Only done when there is something to reload from and nothing pending.
    pub fn purge(&mut self) {
        if !self.is_initial_import_done || self.backing.is_none() || self.has_uncommitted_changes() {
            return;
        }
        self.is_initial_import_done = false;
        self.map = Arc::new(StorageMap::new());
    }

    /// A copy for `namespace_id` that shares this area's map.
    pub(crate) fn shallow_copy(&mut self, namespace_id: NamespaceId, backing: Option<AreaBacking>) -> StorageArea {
        self.import_if_needed();
        StorageArea {
            id: AreaId { namespace_id, origin: self.id.origin.clone() },
            map: self.map.clone(),
            backing,
            commit_batch: None,
            is_initial_import_done: true,
            is_shutdown: self.is_shutdown,
            quota: self.quota,
            bus: self.bus.clone(),
        }
    }

    /// Queues the whole map for writing, replacing whatever the store holds.
    pub(crate) fn schedule_full_commit(&mut self) {
        if self.backing.is_none() {
            return;
        }
        let values = self.map.iter().map(|(k, v)| (k.to_string(), Some(v.to_string()))).collect();
        self.commit_batch = Some(CommitBatch { clear_all_first: true, changed_values: values });
    }

    /// Writes pending changes to the store. On failure the batch is kept for the next attempt.
    pub(crate) fn commit_changes(&mut self) {
        let Some(backing) = &self.backing else {
            self.commit_batch = None;
            return;
        };
        let Some(batch) = self.commit_batch.take() else { return };
        if batch.is_empty() {
            return;
        }

        match backing.commit(&batch) {
            Ok(()) => debug!("committed {} change(s) for {:?}", batch.changed_values.len(), self.id),
            Err(e) => {
                warn!("commit failed for {:?}, will retry: {e:#}", self.id);
                self.commit_batch = Some(batch);
            }
        }
    }

    /// Commits what is pending and stops accepting mutations.
    pub(crate) fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        self.commit_changes();
        self.is_shutdown = true;
    }

    /// Detaches a shut down area from its store. Loaded values stay readable.
    pub(crate) fn release_backing(&mut self) {
        if self.backing.is_none() {
            return;
        }
        self.import_if_needed();
        if self.has_uncommitted_changes() {
            warn!("dropping uncommitted changes for {:?}", self.id);
        }
        self.commit_batch = None;
        self.backing = None;
    }

    fn batch(&mut self) -> &mut CommitBatch {
        self.commit_batch.get_or_insert_with(CommitBatch::default)
    }

    fn import_if_needed(&mut self) {
        if self.is_initial_import_done {
            return;
        }
        self.is_initial_import_done = true;

        let Some(backing) = &self.backing else { return };
        match backing.read_all() {
            Ok(values) => self.map = Arc::new(StorageMap::from(values)),
            // Storage stays usable; the area simply starts empty.
            Err(e) => warn!("failed to load {:?}, starting empty: {e:#}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backing::testing::FlakyLocalStore;
    use crate::storage::backing::{LocalStorageDatabase, NamespaceBacking};
    use crate::storage::event::{RecordingObserver, StorageEvent};
    use crate::storage::local::in_memory::InMemoryLocalStorageDatabase;

    fn o(s: &str) -> Origin {
        Url::parse(s).expect("valid URL").origin()
    }

    fn page() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    fn memory_area(bus: Arc<EventBus>) -> StorageArea {
        StorageArea::new(NamespaceId::new(0), o("https://example.com"), None, 1024, bus)
    }

    fn backed_area(db: Arc<InMemoryLocalStorageDatabase>) -> StorageArea {
        let backing = AreaBacking::new(NamespaceBacking::Local(db), "https://example.com".into());
        StorageArea::new(NamespaceId::new(0), o("https://example.com"), Some(backing), 1024, Arc::new(EventBus::new()))
    }

    #[test]
    fn area_basic_contract() {
        let mut area = memory_area(Arc::new(EventBus::new()));

        assert_eq!(area.length(), 0);
        assert!(area.get_item("missing").is_none());

        area.set_item("a", "1", &page()).unwrap();
        area.set_item("b", "2", &page()).unwrap();
        assert_eq!(area.length(), 2);
        assert_eq!(area.key(0).as_deref(), Some("a"));

        // overwrite keeps length
        assert_eq!(area.set_item("a", "ONE", &page()).unwrap().as_deref(), Some("1"));
        assert_eq!(area.length(), 2);

        assert_eq!(area.remove_item("b", &page()).unwrap().as_deref(), Some("2"));
        assert_eq!(area.remove_item("b", &page()).unwrap(), None);

        assert!(area.clear(&page()).unwrap());
        assert!(!area.clear(&page()).unwrap());
        assert_eq!(area.length(), 0);
    }

    #[test]
    fn events_carry_old_values() {
        let bus = Arc::new(EventBus::new());
        let observer = Arc::new(RecordingObserver::new());
        bus.add(observer.clone());
        let mut area = memory_area(bus);

        area.set_item("k", "v1", &page()).unwrap();
        area.set_item("k", "v1", &page()).unwrap(); // unchanged: silent
        area.remove_item("missing", &page()).unwrap(); // absent: silent
        area.remove_item("k", &page()).unwrap();
        area.clear(&page()).unwrap(); // already empty: silent

        let events = observer.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StorageEvent::ItemSet { old_value: None, new_value, .. } if new_value == "v1"));
        assert!(matches!(&events[1], StorageEvent::ItemRemoved { old_value, .. } if old_value == "v1"));
    }

    #[test]
    fn quota_is_enforced_before_mutation() {
        let mut area = memory_area(Arc::new(EventBus::new()));
        let big = "x".repeat(600); // 1200 bytes > 1024

        let err = area.set_item("k", &big, &page()).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 1024, .. }));
        assert_eq!(area.length(), 0);
    }

    #[test]
    fn shallow_copy_shares_until_written() {
        let mut a = memory_area(Arc::new(EventBus::new()));
        a.set_item("k", "v", &page()).unwrap();

        let mut b = a.shallow_copy(NamespaceId::new(5), None);
        assert!(a.shares_map_with(&b));
        assert_eq!(a.map_ref_count(), 2);

        b.set_item("k", "changed", &page()).unwrap();
        assert!(!a.shares_map_with(&b));
        assert_eq!(a.get_item("k").as_deref(), Some("v"));
        assert_eq!(b.get_item("k").as_deref(), Some("changed"));
        assert_eq!(b.namespace_id(), NamespaceId::new(5));
    }

    #[test]
    fn clear_on_shared_map_leaves_sibling_intact() {
        let mut a = memory_area(Arc::new(EventBus::new()));
        a.set_item("k", "v", &page()).unwrap();
        let mut b = a.shallow_copy(NamespaceId::new(5), None);

        assert!(b.clear(&page()).unwrap());
        assert_eq!(a.get_item("k").as_deref(), Some("v"));
        assert_eq!(b.length(), 0);
    }

    #[test]
    fn backed_area_imports_lazily_and_commits() {
        let db = Arc::new(InMemoryLocalStorageDatabase::new());
        let mut seed = CommitBatch::default();
        seed.changed_values.insert("seed".into(), Some("1".into()));
        db.commit_area("https://example.com", &seed).unwrap();

        let mut area = backed_area(db.clone());
        assert!(!area.is_initial_import_done());
        assert_eq!(area.get_item("seed").as_deref(), Some("1"));

        area.set_item("k", "v", &page()).unwrap();
        area.remove_item("seed", &page()).unwrap();
        assert!(area.has_uncommitted_changes());

        area.commit_changes();
        assert!(!area.has_uncommitted_changes());
        let stored = db.read_area("https://example.com").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["k"], "v");
    }

    #[test]
    fn purge_reloads_from_store() {
        let db = Arc::new(InMemoryLocalStorageDatabase::new());
        let mut area = backed_area(db);
        area.set_item("k", "v", &page()).unwrap();

        area.purge(); // pending changes: ignored
        assert!(area.is_initial_import_done());

        area.commit_changes();
        area.purge();
        assert!(!area.is_initial_import_done());
        assert_eq!(area.get_item("k").as_deref(), Some("v"));
    }

    #[test]
    fn shutdown_commits_and_rejects_writes() {
        let db = Arc::new(InMemoryLocalStorageDatabase::new());
        let mut area = backed_area(db.clone());
        area.set_item("k", "v", &page()).unwrap();

        area.shutdown();
        assert!(area.is_shutdown());
        assert_eq!(db.read_area("https://example.com").unwrap()["k"], "v");

        assert!(matches!(area.set_item("k", "w", &page()), Err(StorageError::ShutDown)));
        assert!(matches!(area.clear(&page()), Err(StorageError::ShutDown)));
        assert_eq!(area.get_item("k").as_deref(), Some("v"));
    }

    #[test]
    fn delete_origin_clears_store_silently() {
        let bus = Arc::new(EventBus::new());
        let observer = Arc::new(RecordingObserver::new());
        bus.add(observer.clone());

        let db = Arc::new(InMemoryLocalStorageDatabase::new());
        let backing = AreaBacking::new(NamespaceBacking::Local(db.clone()), "https://example.com".into());
        let mut area = StorageArea::new(NamespaceId::new(0), o("https://example.com"), Some(backing), 1024, bus);
        area.set_item("k", "v", &page()).unwrap();
        area.commit_changes();
        observer.take();

        area.delete_origin();
        assert!(observer.take().is_empty());
        assert!(db.read_area("https://example.com").unwrap().is_empty());
    }

    fn flaky_area(db: Arc<FlakyLocalStore>) -> StorageArea {
        let backing = AreaBacking::new(NamespaceBacking::Local(db), "https://example.com".into());
        StorageArea::new(NamespaceId::new(0), o("https://example.com"), Some(backing), 1024, Arc::new(EventBus::new()))
    }

    #[test]
    fn failed_commit_is_retried() {
        let db = Arc::new(FlakyLocalStore::default());
        let mut area = flaky_area(db.clone());
        area.set_item("a", "1", &page()).unwrap();

        db.set_failing(true);
        area.commit_changes();
        assert!(area.has_uncommitted_changes());

        // later writes merge into the retained batch
        area.set_item("b", "2", &page()).unwrap();
        db.set_failing(false);
        area.commit_changes();
        assert!(!area.has_uncommitted_changes());
        let stored = db.inner.read_area("https://example.com").unwrap();
        assert_eq!(stored["a"], "1");
        assert_eq!(stored["b"], "2");
    }

    #[test]
    fn failed_import_starts_empty() {
        let db = Arc::new(FlakyLocalStore::default());
        let mut seed = CommitBatch::default();
        seed.changed_values.insert("k".into(), Some("disk".into()));
        db.inner.commit_area("https://example.com", &seed).unwrap();

        db.set_failing(true);
        let mut area = flaky_area(db.clone());
        assert_eq!(area.length(), 0);
        assert!(area.is_initial_import_done());
        area.set_item("n", "1", &page()).unwrap();
        assert_eq!(area.get_item("n").as_deref(), Some("1"));
    }

    #[test]
    fn failed_delete_origin_wipes_on_next_commit() {
        let db = Arc::new(FlakyLocalStore::default());
        let mut area = flaky_area(db.clone());
        area.set_item("k", "v", &page()).unwrap();
        area.commit_changes();

        db.set_failing(true);
        area.delete_origin();
        assert_eq!(area.length(), 0);
        assert!(area.has_uncommitted_changes());
        assert_eq!(db.inner.read_area("https://example.com").unwrap()["k"], "v");

        db.set_failing(false);
        area.commit_changes();
        assert!(!area.has_uncommitted_changes());
        assert!(db.inner.read_area("https://example.com").unwrap().is_empty());
    }

    #[test]
    fn released_area_keeps_values_but_not_the_store() {
        let db = Arc::new(InMemoryLocalStorageDatabase::new());
        let mut area = backed_area(db.clone());
        area.set_item("k", "v", &page()).unwrap();
        area.shutdown();
        area.release_backing();

        assert!(!area.is_backed());
        assert_eq!(Arc::strong_count(&db), 1);
        assert_eq!(area.get_item("k").as_deref(), Some("v"));
    }
}
