use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::storage::backing::{CommitBatch, SessionStorageDatabase};

type Namespaces = HashMap<String, BTreeMap<String, String>>;

/// In‑memory session storage database.
///
/// Maps persistent namespace id -> origin -> serialized map. Share one instance
/// between two contexts to simulate a browser restart.
#[derive(Default)]
pub struct InMemorySessionStorageDatabase {
    namespaces: Mutex<Namespaces>,
}

impl InMemorySessionStorageDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Namespaces>> {
        self.namespaces.lock().map_err(|_| anyhow!("session storage lock poisoned"))
    }
}

impl SessionStorageDatabase for InMemorySessionStorageDatabase {
    fn read_area(&self, persistent_id: &str, origin: &str) -> Result<BTreeMap<String, String>> {
        let guard = self.lock()?;
        match guard.get(persistent_id).and_then(|areas| areas.get(origin)) {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(BTreeMap::new()),
        }
    }

    fn commit_area(&self, persistent_id: &str, origin: &str, batch: &CommitBatch) -> Result<()> {
        let mut guard = self.lock()?;
        let areas = guard.entry(persistent_id.to_string()).or_default();
        let mut values: BTreeMap<String, String> = match areas.get(origin) {
            Some(json) => serde_json::from_str(json)?,
            None => BTreeMap::new(),
        };
        batch.apply_to(&mut values);
        areas.insert(origin.to_string(), serde_json::to_string(&values)?);
        Ok(())
    }

    fn delete_area(&self, persistent_id: &str, origin: &str) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(areas) = guard.get_mut(persistent_id) {
            areas.remove(origin);
            if areas.is_empty() {
                guard.remove(persistent_id);
            }
        }
        Ok(())
    }

    fn clone_namespace(&self, source: &str, destination: &str) -> Result<()> {
        let mut guard = self.lock()?;
        match guard.get(source).cloned() {
            Some(areas) => {
                guard.insert(destination.to_string(), areas);
            }
            None => {
                guard.remove(destination);
            }
        }
        Ok(())
    }

    fn delete_namespace(&self, persistent_id: &str) -> Result<()> {
        self.lock()?.remove(persistent_id);
        Ok(())
    }

    fn read_namespace_ids(&self) -> Result<Vec<String>> {
        let ids: BTreeSet<String> = self.lock()?.keys().cloned().collect();
        Ok(ids.into_iter().collect())
    }

    fn read_origins(&self, persistent_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .get(persistent_id)
            .map(|areas| areas.keys().cloned().collect())
            .unwrap_or_default())
    }
}
