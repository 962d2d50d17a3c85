use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use url::{Origin, Url};

use super::ids::NamespaceId;

/// Identifies the area an event came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AreaId {
    pub namespace_id: NamespaceId,
    pub origin: Origin,
}

impl AreaId {
    pub fn is_local(&self) -> bool {
        self.namespace_id.is_local()
    }
}

/// A change to a storage area, delivered while the mutating call is still running.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageEvent {
    ItemSet {
        area: AreaId,
        key: String,
        new_value: String,
        /// `None` on initial insert.
        old_value: Option<String>,
        page_url: Url,
    },
    ItemRemoved {
        area: AreaId,
        key: String,
        old_value: String,
        page_url: Url,
    },
    AreaCleared {
        area: AreaId,
        page_url: Url,
    },
}

impl StorageEvent {
    pub fn area(&self) -> &AreaId {
        match self {
            StorageEvent::ItemSet { area, .. }
            | StorageEvent::ItemRemoved { area, .. }
            | StorageEvent::AreaCleared { area, .. } => area,
        }
    }
}

/// Observer of local and session storage events on the background sequence.
///
/// Callbacks run inside the mutation that produced them. They must not block
/// and must not call back into the context.
pub trait StorageObserver: Send + Sync {
    fn on_item_set(&self, area: &AreaId, key: &str, new_value: &str, old_value: Option<&str>, page_url: &Url);

    fn on_item_removed(&self, area: &AreaId, key: &str, old_value: &str, page_url: &Url);

    fn on_area_cleared(&self, area: &AreaId, page_url: &Url);
}

/// Handle returned on registration, used to unregister.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registration table shared by a context and all of its areas.
///
/// Registration and delivery both happen on the background sequence; the lock
/// only makes the table shareable between the context and its areas.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Arc<dyn StorageObserver>)>>,
}

impl Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn StorageObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut guard) = self.observers.write() {
            guard.push((id, observer));
        }
        id
    }

    /// Returns `false` when the id was not registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let Ok(mut guard) = self.observers.write() else {
            return false;
        };
        let before = guard.len();
        guard.retain(|(oid, _)| *oid != id);
        guard.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_item_set(&self, area: &AreaId, key: &str, new_value: &str, old_value: Option<&str>, page_url: &Url) {
        for observer in self.snapshot() {
            observer.on_item_set(area, key, new_value, old_value, page_url);
        }
    }

    pub fn notify_item_removed(&self, area: &AreaId, key: &str, old_value: &str, page_url: &Url) {
        for observer in self.snapshot() {
            observer.on_item_removed(area, key, old_value, page_url);
        }
    }

    pub fn notify_area_cleared(&self, area: &AreaId, page_url: &Url) {
        for observer in self.snapshot() {
            observer.on_area_cleared(area, page_url);
        }
    }

    // Observers are called without holding the lock.
    fn snapshot(&self) -> Vec<Arc<dyn StorageObserver>> {
        self.observers
            .read()
            .map(|g| g.iter().map(|(_, o)| o.clone()).collect())
            .unwrap_or_default()
    }
}

/// A handle for receiving storage change notifications on any thread.
pub type Subscription = broadcast::Receiver<StorageEvent>;

/// Observer that republishes every event on a broadcast channel.
#[derive(Debug)]
pub struct BroadcastObserver {
    tx: broadcast::Sender<StorageEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> Subscription {
        self.tx.subscribe()
    }

    fn publish(&self, ev: StorageEvent) {
        // Only fails when nobody is subscribed, which is fine.
        let _ = self.tx.send(ev);
    }
}

impl StorageObserver for BroadcastObserver {
    fn on_item_set(&self, area: &AreaId, key: &str, new_value: &str, old_value: Option<&str>, page_url: &Url) {
        self.publish(StorageEvent::ItemSet {
            area: area.clone(),
            key: key.to_string(),
            new_value: new_value.to_string(),
            old_value: old_value.map(str::to_string),
            page_url: page_url.clone(),
        });
    }

    fn on_item_removed(&self, area: &AreaId, key: &str, old_value: &str, page_url: &Url) {
        self.publish(StorageEvent::ItemRemoved {
            area: area.clone(),
            key: key.to_string(),
            old_value: old_value.to_string(),
            page_url: page_url.clone(),
        });
    }

    fn on_area_cleared(&self, area: &AreaId, page_url: &Url) {
        self.publish(StorageEvent::AreaCleared {
            area: area.clone(),
            page_url: page_url.clone(),
        });
    }
}

/// Observer that records events in memory. Handy in tests and for debugging tools.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<StorageEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns and clears the recorded events.
    pub fn take(&self) -> Vec<StorageEvent> {
        self.events.lock().map(|mut g| std::mem::take(&mut *g)).unwrap_or_default()
    }

    fn push(&self, ev: StorageEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

impl StorageObserver for RecordingObserver {
    fn on_item_set(&self, area: &AreaId, key: &str, new_value: &str, old_value: Option<&str>, page_url: &Url) {
        self.push(StorageEvent::ItemSet {
            area: area.clone(),
            key: key.to_string(),
            new_value: new_value.to_string(),
            old_value: old_value.map(str::to_string),
            page_url: page_url.clone(),
        });
    }

    fn on_item_removed(&self, area: &AreaId, key: &str, old_value: &str, page_url: &Url) {
        self.push(StorageEvent::ItemRemoved {
            area: area.clone(),
            key: key.to_string(),
            old_value: old_value.to_string(),
            page_url: page_url.clone(),
        });
    }

    fn on_area_cleared(&self, area: &AreaId, page_url: &Url) {
        self.push(StorageEvent::AreaCleared {
            area: area.clone(),
            page_url: page_url.clone(),
        });
    }
}
