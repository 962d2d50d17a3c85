use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::params;
use r2d2_sqlite::SqliteConnectionManager;

use crate::storage::backing::{CommitBatch, SessionStorageDatabase};
use crate::storage::local::sqlite_store::open_pool;

/// File name used inside the session storage directory.
pub const SESSION_STORAGE_DB_FILE: &str = "sessionstorage.sqlite";

// `session_areas` records which origins a namespace holds, even when empty.
const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS session_areas (
    namespace_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    PRIMARY KEY(namespace_id, origin)
);
CREATE TABLE IF NOT EXISTS session_storage (
    namespace_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY(namespace_id, origin, key)
);";

/// SQLite-based session storage database, one file for all persistent namespaces.
pub struct SqliteSessionStorageDatabase {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteSessionStorageDatabase {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { pool: open_pool(path.as_ref(), SCHEMA)? })
    }

    /// Opens the database inside a session storage directory, creating the directory if needed.
    pub fn in_directory(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Self::new(dir.as_ref().join(SESSION_STORAGE_DB_FILE))
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl SessionStorageDatabase for SqliteSessionStorageDatabase {
    fn read_area(&self, persistent_id: &str, origin: &str) -> Result<BTreeMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM session_storage WHERE namespace_id=?1 AND origin=?2",
        )?;
        let rows = stmt.query_map(params![persistent_id, origin], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut values = BTreeMap::new();
        for row in rows {
            let (k, v) = row?;
            values.insert(k, v);
        }
        Ok(values)
    }

    fn commit_area(&self, persistent_id: &str, origin: &str, batch: &CommitBatch) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO session_areas(namespace_id, origin) VALUES (?1, ?2)",
            params![persistent_id, origin],
        )?;
        if batch.clear_all_first {
            tx.execute(
                "DELETE FROM session_storage WHERE namespace_id=?1 AND origin=?2",
                params![persistent_id, origin],
            )?;
        }
        for (key, value) in &batch.changed_values {
            match value {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO session_storage(namespace_id, origin, key, value) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(namespace_id, origin, key) DO UPDATE SET value=excluded.value",
                        params![persistent_id, origin, key, value],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM session_storage WHERE namespace_id=?1 AND origin=?2 AND key=?3",
                        params![persistent_id, origin, key],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_area(&self, persistent_id: &str, origin: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM session_storage WHERE namespace_id=?1 AND origin=?2",
            params![persistent_id, origin],
        )?;
        tx.execute(
            "DELETE FROM session_areas WHERE namespace_id=?1 AND origin=?2",
            params![persistent_id, origin],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn clone_namespace(&self, source: &str, destination: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM session_storage WHERE namespace_id=?1", params![destination])?;
        tx.execute("DELETE FROM session_areas WHERE namespace_id=?1", params![destination])?;
        tx.execute(
            "INSERT INTO session_areas(namespace_id, origin)
             SELECT ?2, origin FROM session_areas WHERE namespace_id=?1",
            params![source, destination],
        )?;
        tx.execute(
            "INSERT INTO session_storage(namespace_id, origin, key, value)
             SELECT ?2, origin, key, value FROM session_storage WHERE namespace_id=?1",
            params![source, destination],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_namespace(&self, persistent_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM session_storage WHERE namespace_id=?1", params![persistent_id])?;
        tx.execute("DELETE FROM session_areas WHERE namespace_id=?1", params![persistent_id])?;
        tx.commit()?;
        Ok(())
    }

    fn read_namespace_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT namespace_id FROM session_areas ORDER BY namespace_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn read_origins(&self, persistent_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT origin FROM session_areas WHERE namespace_id=?1 ORDER BY origin",
        )?;
        let rows = stmt.query_map(params![persistent_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> CommitBatch {
        let mut batch = CommitBatch::default();
        batch.changed_values.insert(key.into(), Some(value.into()));
        batch
    }

    #[test]
    fn namespaces_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = SqliteSessionStorageDatabase::in_directory(dir.path()).unwrap();
            db.commit_area("ns1", "https://a.test", &put("k", "v")).unwrap();
            db.commit_area("ns2", "https://b.test", &CommitBatch::default()).unwrap();
        }

        let db = SqliteSessionStorageDatabase::in_directory(dir.path()).unwrap();
        assert_eq!(db.read_namespace_ids().unwrap(), vec!["ns1", "ns2"]);
        assert_eq!(db.read_area("ns1", "https://a.test").unwrap()["k"], "v");
        // empty areas are still listed
        assert_eq!(db.read_origins("ns2").unwrap(), vec!["https://b.test"]);
        assert!(db.read_area("ghost", "https://a.test").unwrap().is_empty());
    }

    #[test]
    fn clone_then_delete_source() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteSessionStorageDatabase::in_directory(dir.path()).unwrap();
        db.commit_area("src", "https://a.test", &put("k", "v")).unwrap();
        db.commit_area("dst", "https://z.test", &put("stale", "1")).unwrap();

        db.clone_namespace("src", "dst").unwrap();
        assert_eq!(db.read_origins("dst").unwrap(), vec!["https://a.test"]);

        db.delete_namespace("src").unwrap();
        assert_eq!(db.read_namespace_ids().unwrap(), vec!["dst"]);
        assert_eq!(db.read_area("dst", "https://a.test").unwrap()["k"], "v");
    }

    #[test]
    fn delete_area_leaves_other_origins() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteSessionStorageDatabase::in_directory(dir.path()).unwrap();
        db.commit_area("ns", "https://a.test", &put("k", "v")).unwrap();
        db.commit_area("ns", "https://b.test", &put("k", "v")).unwrap();

        db.delete_area("ns", "https://a.test").unwrap();
        let usage = db.usage().unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].origin.ascii_serialization(), "https://b.test");
    }
}
