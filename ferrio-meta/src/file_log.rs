//! Append-only file-log backend.
//!
//! One UTF-8 line per record, `ADD|filename|hash|location|storageId`, with
//! an open-append-flush-sync-close cycle per write so a crash never loses an
//! acknowledged commit. Queries are served from in-memory maps rebuilt by
//! replaying the log at startup, including the id→hash reverse index.

use crate::backend::MetadataBackend;
use crate::error::{MetaError, Result};
use crate::record::MetaRecord;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

pub struct FileLogBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
    by_hash: RwLock<HashMap<String, MetaRecord>>,
    hash_by_id: RwLock<HashMap<String, String>>,
}

impl FileLogBackend {
    /// Open (or create) the log and replay it into the in-memory maps.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let backend = Self {
            path,
            write_lock: Mutex::new(()),
            by_hash: RwLock::new(HashMap::new()),
            hash_by_id: RwLock::new(HashMap::new()),
        };

        let records = backend.replay()?;
        tracing::info!(
            "file metadata log replayed: {} records from {}",
            records.len(),
            backend.path.display()
        );
        backend.index(&records);

        Ok(backend)
    }

    fn replay(&self) -> Result<Vec<MetaRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!("skipping unreadable metadata line: {}", error);
                }
            }
        }
        Ok(records)
    }

    fn index(&self, records: &[MetaRecord]) {
        let mut by_hash = self.by_hash.write().expect("by_hash lock poisoned");
        let mut hash_by_id = self.hash_by_id.write().expect("hash_by_id lock poisoned");
        for record in records {
            by_hash.insert(record.hash.clone(), record.clone());
            hash_by_id.insert(record.storage_id.clone(), record.hash.clone());
        }
    }
}

fn parse_line(line: &str) -> Result<MetaRecord> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 5 || parts[0] != "ADD" {
        return Err(MetaError::MalformedRecord(line.to_string()));
    }
    Ok(MetaRecord {
        filename: parts[1].to_string(),
        hash: parts[2].to_string(),
        location: parts[3].to_string(),
        storage_id: parts[4].to_string(),
    })
}

impl MetadataBackend for FileLogBackend {
    fn query_by_hash(&self, hash: &str) -> Result<Option<MetaRecord>> {
        Ok(self
            .by_hash
            .read()
            .expect("by_hash lock poisoned")
            .get(hash)
            .cloned())
    }

    fn query_hash_by_storage_id(&self, storage_id: &str) -> Result<Option<String>> {
        Ok(self
            .hash_by_id
            .read()
            .expect("hash_by_id lock poisoned")
            .get(storage_id)
            .cloned())
    }

    fn log_add_file(&self, record: &MetaRecord) -> Result<()> {
        record.validate_fields()?;

        let line = format!(
            "ADD|{}|{}|{}|{}\n",
            record.filename, record.hash, record.location, record.storage_id
        );

        {
            let _guard = self.write_lock.lock().expect("write lock poisoned");
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write_all(line.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
        }

        self.by_hash
            .write()
            .expect("by_hash lock poisoned")
            .insert(record.hash.clone(), record.clone());
        self.hash_by_id
            .write()
            .expect("hash_by_id lock poisoned")
            .insert(record.storage_id.clone(), record.hash.clone());

        Ok(())
    }

    // Single-process mode: the in-memory pending set is the only gate.
    fn try_acquire_upload_lock(&self, _hash: &str, _node_id: &str) -> Result<bool> {
        Ok(true)
    }

    fn release_upload_lock(&self, _hash: &str) -> Result<()> {
        Ok(())
    }

    fn recover(&self) -> Result<Vec<MetaRecord>> {
        self.replay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(suffix: &str) -> MetaRecord {
        MetaRecord {
            filename: format!("file-{}.bin", suffix),
            hash: format!("{:0>64}", suffix),
            location: "10.0.0.2:5369".to_string(),
            storage_id: format!("id-{}", suffix),
        }
    }

    #[test]
    fn append_then_replay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("namenode_meta.log");

        {
            let backend = FileLogBackend::open(path.clone()).expect("open");
            backend.log_add_file(&record("a")).expect("log a");
            backend.log_add_file(&record("b")).expect("log b");

            let found = backend
                .query_by_hash(&record("a").hash)
                .expect("query")
                .expect("present");
            assert_eq!(found.filename, "file-a.bin");
        }

        // A fresh instance rebuilds both indexes from the log.
        let reopened = FileLogBackend::open(path).expect("reopen");
        assert_eq!(
            reopened
                .query_hash_by_storage_id("id-b")
                .expect("query")
                .as_deref(),
            Some(record("b").hash.as_str())
        );
        assert_eq!(reopened.recover().expect("recover").len(), 2);
    }

    #[test]
    fn rejects_pipes_in_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileLogBackend::open(dir.path().join("meta.log")).expect("open");

        let mut bad = record("c");
        bad.filename = "evil|name".to_string();
        assert!(backend.log_add_file(&bad).is_err());
        assert!(backend
            .query_by_hash(&bad.hash)
            .expect("query")
            .is_none());
    }

    #[test]
    fn upload_lock_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileLogBackend::open(dir.path().join("meta.log")).expect("open");
        assert!(backend.try_acquire_upload_lock("h", "n").expect("lock"));
        assert!(backend.try_acquire_upload_lock("h", "m").expect("lock"));
        backend.release_upload_lock("h").expect("unlock");
    }

    #[test]
    fn replay_skips_garbage_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.log");
        std::fs::write(&path, "ADD|f|h|l|id\nGARBAGE\nADD|only|four|fields\n").expect("seed");

        let backend = FileLogBackend::open(path).expect("open");
        assert_eq!(backend.recover().expect("recover").len(), 1);
        assert!(backend.query_by_hash("h").expect("query").is_some());
    }
}
