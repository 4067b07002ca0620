//! Relational backend over SQLite.
//!
//! Multiple name services point at one database path; the
//! `file_upload_lock` table is the cluster-wide single-writer gate. The
//! commit path is one transaction: insert metadata, upsert-ignore the
//! location, drop the lock.

use crate::backend::MetadataBackend;
use crate::error::{MetaError, Result};
use crate::record::MetaRecord;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::time::Duration;

/// A held upload lock is stolen once its expiry passes.
pub const UPLOAD_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

pub struct SqliteBackend {
    db_path: PathBuf,
}

impl SqliteBackend {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let backend = Self { db_path };
        backend.ensure_schema()?;
        Ok(backend)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS file_metadata (
                storage_id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                create_time TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_file_metadata_hash
                ON file_metadata(file_hash);
            CREATE TABLE IF NOT EXISTS file_location (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_hash TEXT NOT NULL,
                datanode_addr TEXT NOT NULL,
                create_time TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(file_hash, datanode_addr)
            );
            CREATE TABLE IF NOT EXISTS file_upload_lock (
                file_hash TEXT PRIMARY KEY,
                namenode_id TEXT NOT NULL,
                expire_time INTEGER NOT NULL,
                create_time TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;
        Ok(())
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

impl MetadataBackend for SqliteBackend {
    fn query_by_hash(&self, hash: &str) -> Result<Option<MetaRecord>> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                "SELECT m.filename, m.file_hash, m.storage_id, l.datanode_addr
                 FROM file_metadata m
                 JOIN file_location l ON m.file_hash = l.file_hash
                 WHERE m.file_hash = ?1
                 LIMIT 1",
                params![hash],
                |row| {
                    Ok(MetaRecord {
                        filename: row.get(0)?,
                        hash: row.get(1)?,
                        storage_id: row.get(2)?,
                        location: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn query_hash_by_storage_id(&self, storage_id: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let hash = conn
            .query_row(
                "SELECT file_hash FROM file_metadata WHERE storage_id = ?1",
                params![storage_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    fn log_add_file(&self, record: &MetaRecord) -> Result<()> {
        record.validate_fields()?;

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO file_metadata (storage_id, filename, file_hash) VALUES (?1, ?2, ?3)",
            params![record.storage_id, record.filename, record.hash],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO file_location (file_hash, datanode_addr) VALUES (?1, ?2)",
            params![record.hash, record.location],
        )?;
        tx.execute(
            "DELETE FROM file_upload_lock WHERE file_hash = ?1",
            params![record.hash],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn try_acquire_upload_lock(&self, hash: &str, node_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        let now = Self::now_ms();

        conn.execute(
            "DELETE FROM file_upload_lock WHERE file_hash = ?1 AND expire_time < ?2",
            params![hash, now],
        )?;

        let expire = now + UPLOAD_LOCK_TTL.as_millis() as i64;
        let inserted = conn.execute(
            "INSERT INTO file_upload_lock (file_hash, namenode_id, expire_time)
             VALUES (?1, ?2, ?3)",
            params![hash, node_id, expire],
        );

        match inserted {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(error, _))
                if error.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn release_upload_lock(&self, hash: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM file_upload_lock WHERE file_hash = ?1",
            params![hash],
        )?;
        Ok(())
    }

    fn recover(&self) -> Result<Vec<MetaRecord>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(
            "SELECT m.filename, m.file_hash, m.storage_id, l.datanode_addr
             FROM file_metadata m
             JOIN file_location l ON m.file_hash = l.file_hash",
        )?;

        let rows = statement.query_map([], |row| {
            Ok(MetaRecord {
                filename: row.get(0)?,
                hash: row.get(1)?,
                storage_id: row.get(2)?,
                location: row.get(3)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SqliteBackend::open(dir.path().join("meta.sqlite3")).expect("open");
        (dir, backend)
    }

    fn record(hash: &str, id: &str) -> MetaRecord {
        MetaRecord {
            filename: "report.pdf".to_string(),
            hash: hash.to_string(),
            location: "10.0.0.2:5369".to_string(),
            storage_id: id.to_string(),
        }
    }

    #[test]
    fn commit_then_query_both_ways() {
        let (_dir, backend) = backend();
        let rec = record(&"a".repeat(64), "11111111-1111-1111-1111-111111111111");

        backend.log_add_file(&rec).expect("log");

        let by_hash = backend
            .query_by_hash(&rec.hash)
            .expect("query")
            .expect("present");
        assert_eq!(by_hash, rec);

        let hash = backend
            .query_hash_by_storage_id(&rec.storage_id)
            .expect("query")
            .expect("present");
        assert_eq!(hash, rec.hash);

        assert!(backend
            .query_by_hash(&"b".repeat(64))
            .expect("query")
            .is_none());
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let (_dir, backend) = backend();
        let hash = "c".repeat(64);

        assert!(backend.try_acquire_upload_lock(&hash, "node-1").expect("acquire"));
        assert!(!backend.try_acquire_upload_lock(&hash, "node-2").expect("conflict"));

        backend.release_upload_lock(&hash).expect("release");
        assert!(backend.try_acquire_upload_lock(&hash, "node-2").expect("reacquire"));
    }

    #[test]
    fn expired_lock_is_stolen() {
        let (_dir, backend) = backend();
        let hash = "d".repeat(64);

        // Plant an already-expired row.
        let conn = backend.connection().expect("conn");
        conn.execute(
            "INSERT INTO file_upload_lock (file_hash, namenode_id, expire_time)
             VALUES (?1, 'node-1', ?2)",
            params![hash, SqliteBackend::now_ms() - 1000],
        )
        .expect("seed");

        assert!(backend.try_acquire_upload_lock(&hash, "node-2").expect("steal"));
    }

    #[test]
    fn commit_releases_the_lock() {
        let (_dir, backend) = backend();
        let rec = record(&"e".repeat(64), "22222222-2222-2222-2222-222222222222");

        assert!(backend
            .try_acquire_upload_lock(&rec.hash, "node-1")
            .expect("acquire"));
        backend.log_add_file(&rec).expect("log");

        // The transaction dropped the lock row.
        assert!(backend
            .try_acquire_upload_lock(&rec.hash, "node-2")
            .expect("free again"));
    }

    #[test]
    fn duplicate_location_rows_are_ignored() {
        let (_dir, backend) = backend();
        let hash = "f".repeat(64);

        backend
            .log_add_file(&record(&hash, "33333333-3333-3333-3333-333333333333"))
            .expect("first");
        backend
            .log_add_file(&record(&hash, "44444444-4444-4444-4444-444444444444"))
            .expect("second");

        assert_eq!(backend.recover().expect("recover").len(), 2);

        let conn = backend.connection().expect("conn");
        let locations: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM file_location WHERE file_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(locations, 1);
    }
}
