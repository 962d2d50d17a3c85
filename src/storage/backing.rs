//! Persistence seams: the store traits and the per-area binding to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use super::types::{LocalStorageUsageInfo, SessionStorageUsageInfo};

/// Changes accumulated by an area since its last commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitBatch {
    /// Wipe everything stored for the area before applying `changed_values`.
    pub clear_all_first: bool,
    /// `None` marks a removed key.
    pub changed_values: BTreeMap<String, Option<String>>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        !self.clear_all_first && self.changed_values.is_empty()
    }

    /// Applies the batch to a plain map, the way a store would.
    pub fn apply_to(&self, values: &mut BTreeMap<String, String>) {
        if self.clear_all_first {
            values.clear();
        }
        for (key, value) in &self.changed_values {
            match value {
                Some(v) => {
                    values.insert(key.clone(), v.clone());
                }
                None => {
                    values.remove(key);
                }
            }
        }
    }
}

/// Durable store for local storage, one table per origin.
pub trait LocalStorageDatabase: Send + Sync {
    /// Returns everything stored for `origin`; empty when nothing was ever written.
    fn read_area(&self, origin: &str) -> Result<BTreeMap<String, String>>;

    fn commit_area(&self, origin: &str, batch: &CommitBatch) -> Result<()>;

    /// Idempotent.
    fn delete_area(&self, origin: &str) -> Result<()>;

    /// Footprint of every stored origin. `last_modified` is only filled in when asked for.
    fn usage(&self, include_last_modified: bool) -> Result<Vec<LocalStorageUsageInfo>>;
}

/// Durable store for session storage, keyed by (persistent namespace id, origin).
pub trait SessionStorageDatabase: Send + Sync {
    /// Returns everything stored for the pair; empty for ids that were never written.
    fn read_area(&self, persistent_id: &str, origin: &str) -> Result<BTreeMap<String, String>>;

    fn commit_area(&self, persistent_id: &str, origin: &str, batch: &CommitBatch) -> Result<()>;

    fn delete_area(&self, persistent_id: &str, origin: &str) -> Result<()>;

    /// Copies every area of `source` to `destination`, replacing what `destination` held.
    fn clone_namespace(&self, source: &str, destination: &str) -> Result<()>;

    /// Idempotent.
    fn delete_namespace(&self, persistent_id: &str) -> Result<()>;

    fn read_namespace_ids(&self) -> Result<Vec<String>>;

    fn read_origins(&self, persistent_id: &str) -> Result<Vec<String>>;

    fn usage(&self) -> Result<Vec<SessionStorageUsageInfo>> {
        let mut out = Vec::new();
        for persistent_id in self.read_namespace_ids()? {
            for origin in self.read_origins(&persistent_id)? {
                if let Some(origin) = super::types::parse_origin(&origin) {
                    out.push(SessionStorageUsageInfo {
                        persistent_namespace_id: persistent_id.clone(),
                        origin,
                    });
                }
            }
        }
        Ok(out)
    }
}

pub type LocalStoreHandle = Arc<dyn LocalStorageDatabase>;
pub type SessionStoreHandle = Arc<dyn SessionStorageDatabase>;

/// Where a namespace writes its areas.
#[derive(Clone)]
pub enum NamespaceBacking {
    Local(LocalStoreHandle),
    Session {
        db: SessionStoreHandle,
        persistent_id: String,
    },
}

/// Binds one area (an origin inside a namespace) to its store.
#[derive(Clone)]
pub struct AreaBacking {
    namespace: NamespaceBacking,
    origin: String,
}

impl AreaBacking {
    pub fn new(namespace: NamespaceBacking, origin: String) -> Self {
        Self { namespace, origin }
    }

    pub fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match &self.namespace {
            NamespaceBacking::Local(db) => db.read_area(&self.origin),
            NamespaceBacking::Session { db, persistent_id } => db.read_area(persistent_id, &self.origin),
        }
    }

    pub fn commit(&self, batch: &CommitBatch) -> Result<()> {
        match &self.namespace {
            NamespaceBacking::Local(db) => db.commit_area(&self.origin, batch),
            NamespaceBacking::Session { db, persistent_id } => db.commit_area(persistent_id, &self.origin, batch),
        }
    }

    pub fn delete(&self) -> Result<()> {
        match &self.namespace {
            NamespaceBacking::Local(db) => db.delete_area(&self.origin),
            NamespaceBacking::Session { db, persistent_id } => db.delete_area(persistent_id, &self.origin),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_clear_then_changes() {
        let mut values = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);

        let mut batch = CommitBatch::default();
        assert!(batch.is_empty());
        batch.changed_values.insert("b".into(), None);
        batch.changed_values.insert("c".into(), Some("3".into()));
        batch.apply_to(&mut values);
        assert_eq!(values.keys().cloned().collect::<Vec<_>>(), vec!["a", "c"]);

        let clearing = CommitBatch { clear_all_first: true, ..Default::default() };
        assert!(!clearing.is_empty());
        clearing.apply_to(&mut values);
        assert!(values.is_empty());
    }
}
