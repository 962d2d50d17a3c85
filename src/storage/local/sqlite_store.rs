use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{params, OpenFlags};
use r2d2_sqlite::SqliteConnectionManager;
use time::OffsetDateTime;

use crate::storage::backing::{CommitBatch, LocalStorageDatabase};
use crate::storage::types::{parse_origin, utf16_bytes, LocalStorageUsageInfo};

/// File name used inside the local storage directory.
pub const LOCAL_STORAGE_DB_FILE: &str = "localstorage.sqlite";

/// Builds a pool whose connections all run `schema` on open.
pub(crate) fn open_pool(path: &Path, schema: &'static str) -> Result<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE |
                OpenFlags::SQLITE_OPEN_CREATE |
                OpenFlags::SQLITE_OPEN_URI
        )
        .with_init(move |c| {
            c.busy_timeout(std::time::Duration::from_millis(500))?;
            c.pragma_update(None, "journal_mode", &"WAL")?;
            c.execute_batch(schema)?;
            Ok(())
        });

    let pool = Pool::builder()
        .max_size(4)
        .connection_timeout(std::time::Duration::from_secs(5))
        .build(manager)?;

    Ok(pool)
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS local_storage (
    origin TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
    PRIMARY KEY(origin, key)
);";

/// SQLite-based local storage database
pub struct SqliteLocalStorageDatabase {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLocalStorageDatabase {
    /// Opens (or creates) the database file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { pool: open_pool(path.as_ref(), SCHEMA)? })
    }

    /// Opens the database inside a local storage directory, creating the directory if needed.
    pub fn in_directory(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Self::new(dir.as_ref().join(LOCAL_STORAGE_DB_FILE))
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl LocalStorageDatabase for SqliteLocalStorageDatabase {
    fn read_area(&self, origin: &str) -> Result<BTreeMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM local_storage WHERE origin=?1")?;
        let rows = stmt.query_map(params![origin], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut values = BTreeMap::new();
        for row in rows {
            let (k, v) = row?;
            values.insert(k, v);
        }
        Ok(values)
    }

    fn commit_area(&self, origin: &str, batch: &CommitBatch) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if batch.clear_all_first {
            tx.execute("DELETE FROM local_storage WHERE origin=?1", params![origin])?;
        }
        for (key, value) in &batch.changed_values {
            match value {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO local_storage(origin,key,value) VALUES (?1,?2,?3)
                         ON CONFLICT(origin,key) DO UPDATE
                         SET value=excluded.value, updated_at=strftime('%s','now')",
                        params![origin, key, value],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM local_storage WHERE origin=?1 AND key=?2",
                        params![origin, key],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_area(&self, origin: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM local_storage WHERE origin=?1", params![origin])?;
        Ok(())
    }

    fn usage(&self, include_last_modified: bool) -> Result<Vec<LocalStorageUsageInfo>> {
        let conn = self.conn()?;
        // Sized in Rust: SQLite's length() counts code points, quota counts UTF-16 units.
        let mut stmt = conn.prepare("SELECT origin, key, value, updated_at FROM local_storage ORDER BY origin")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut totals: BTreeMap<String, (u64, i64)> = BTreeMap::new();
        for row in rows {
            let (origin, key, value, updated_at) = row?;
            let entry = totals.entry(origin).or_insert((0, i64::MIN));
            entry.0 += (utf16_bytes(&key) + utf16_bytes(&value)) as u64;
            entry.1 = entry.1.max(updated_at);
        }

        let mut out = Vec::new();
        for (origin, (data_size, updated_at)) in totals {
            let Some(origin) = parse_origin(&origin) else { continue };
            out.push(LocalStorageUsageInfo {
                origin,
                data_size,
                last_modified: if include_last_modified {
                    OffsetDateTime::from_unix_timestamp(updated_at).ok()
                } else {
                    None
                },
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::in_memory::InMemoryLocalStorageDatabase;

    fn put(key: &str, value: &str) -> CommitBatch {
        let mut batch = CommitBatch::default();
        batch.changed_values.insert(key.into(), Some(value.into()));
        batch
    }

    #[test]
    fn commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = SqliteLocalStorageDatabase::in_directory(dir.path()).unwrap();
            db.commit_area("https://a.test", &put("k", "v")).unwrap();
            db.commit_area("https://a.test", &put("gone", "x")).unwrap();

            let mut removal = CommitBatch::default();
            removal.changed_values.insert("gone".into(), None);
            db.commit_area("https://a.test", &removal).unwrap();
        }

        let db = SqliteLocalStorageDatabase::in_directory(dir.path()).unwrap();
        let values = db.read_area("https://a.test").unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["k"], "v");
    }

    #[test]
    fn clear_all_first_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteLocalStorageDatabase::in_directory(dir.path()).unwrap();
        db.commit_area("https://a.test", &put("old", "1")).unwrap();

        let mut batch = put("new", "2");
        batch.clear_all_first = true;
        db.commit_area("https://a.test", &batch).unwrap();

        let values = db.read_area("https://a.test").unwrap();
        assert_eq!(values.keys().cloned().collect::<Vec<_>>(), vec!["new"]);
    }

    #[test]
    fn usage_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteLocalStorageDatabase::in_directory(dir.path()).unwrap();
        db.commit_area("https://a.test", &put("ab", "cd")).unwrap();
        db.commit_area("https://b.test:8080", &put("k", "v")).unwrap();

        let usage = db.usage(true).unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].origin.ascii_serialization(), "https://a.test");
        assert_eq!(usage[0].data_size, 8);
        assert!(usage[0].last_modified.is_some());

        db.delete_area("https://a.test").unwrap();
        let usage = db.usage(false).unwrap();
        assert_eq!(usage.len(), 1);
        assert!(usage[0].last_modified.is_none());
    }

    #[test]
    fn usage_counts_utf16_units_like_memory_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteLocalStorageDatabase::in_directory(dir.path()).unwrap();
        let memory = InMemoryLocalStorageDatabase::new();
        // one surrogate pair plus one BMP character
        let batch = put("\u{1F600}", "\u{e9}");
        db.commit_area("https://a.test", &batch).unwrap();
        memory.commit_area("https://a.test", &batch).unwrap();

        assert_eq!(db.usage(false).unwrap()[0].data_size, 6);
        assert_eq!(memory.usage(false).unwrap()[0].data_size, 6);
    }
}
