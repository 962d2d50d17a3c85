use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use time::OffsetDateTime;

use crate::storage::backing::{CommitBatch, LocalStorageDatabase};
use crate::storage::types::{parse_origin, utf16_bytes, LocalStorageUsageInfo};

/// A serialized area plus its modification time.
struct StoredArea {
    json: String,
    last_modified: OffsetDateTime,
}

/// In‑memory local storage database. Contents are kept serialized, so a second
/// context opened on the same instance sees exactly what was committed.
#[derive(Default)]
pub struct InMemoryLocalStorageDatabase {
    areas: Mutex<HashMap<String, StoredArea>>,
}

impl InMemoryLocalStorageDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

fn decode(json: &str) -> Result<BTreeMap<String, String>> {
    Ok(serde_json::from_str(json)?)
}

impl LocalStorageDatabase for InMemoryLocalStorageDatabase {
    fn read_area(&self, origin: &str) -> Result<BTreeMap<String, String>> {
        let guard = self.areas.lock().map_err(|_| anyhow!("local storage lock poisoned"))?;
        match guard.get(origin) {
            Some(stored) => decode(&stored.json),
            None => Ok(BTreeMap::new()),
        }
    }

    fn commit_area(&self, origin: &str, batch: &CommitBatch) -> Result<()> {
        let mut guard = self.areas.lock().map_err(|_| anyhow!("local storage lock poisoned"))?;
        let mut values = match guard.get(origin) {
            Some(stored) => decode(&stored.json)?,
            None => BTreeMap::new(),
        };
        batch.apply_to(&mut values);

        if values.is_empty() {
            guard.remove(origin);
        } else {
            guard.insert(origin.to_string(), StoredArea {
                json: serde_json::to_string(&values)?,
                last_modified: OffsetDateTime::now_utc(),
            });
        }
        Ok(())
    }

    fn delete_area(&self, origin: &str) -> Result<()> {
        let mut guard = self.areas.lock().map_err(|_| anyhow!("local storage lock poisoned"))?;
        guard.remove(origin);
        Ok(())
    }

    fn usage(&self, include_last_modified: bool) -> Result<Vec<LocalStorageUsageInfo>> {
        let guard = self.areas.lock().map_err(|_| anyhow!("local storage lock poisoned"))?;
        let mut out = Vec::with_capacity(guard.len());
        for (key, stored) in guard.iter() {
            let Some(origin) = parse_origin(key) else { continue };
            let values = decode(&stored.json)?;
            let data_size = values.iter().map(|(k, v)| utf16_bytes(k) + utf16_bytes(v)).sum::<usize>();
            out.push(LocalStorageUsageInfo {
                origin,
                data_size: data_size as u64,
                last_modified: include_last_modified.then_some(stored.last_modified),
            });
        }
        out.sort_by(|a, b| a.origin.ascii_serialization().cmp(&b.origin.ascii_serialization()));
        Ok(out)
    }
}
