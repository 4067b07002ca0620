//! Cache-fronted metadata store.
//!
//! A write-through LRU (plus a reverse id→hash index) sits in front of the
//! configured backend. Backend calls run on the blocking pool; the cache is
//! optional and a disabled cache degrades every call to a backend hit.

use crate::backend::MetadataBackend;
use crate::error::{MetaError, Result};
use crate::record::MetaRecord;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100_000,
        }
    }
}

struct Caches {
    by_hash: LruCache<String, MetaRecord>,
    hash_by_id: LruCache<String, String>,
}

pub struct MetaStore {
    backend: Arc<dyn MetadataBackend>,
    caches: Option<Mutex<Caches>>,
}

impl MetaStore {
    pub fn new(backend: Arc<dyn MetadataBackend>, config: CacheConfig) -> Self {
        let caches = if config.enabled {
            let capacity = NonZeroUsize::new(config.max_size.max(1))
                .expect("capacity is at least one");
            tracing::info!("metadata cache enabled, max {} entries", capacity);
            Some(Mutex::new(Caches {
                by_hash: LruCache::new(capacity),
                hash_by_id: LruCache::new(capacity),
            }))
        } else {
            tracing::info!("metadata cache disabled");
            None
        };

        Self { backend, caches }
    }

    async fn run_blocking<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MetadataBackend) -> Result<T> + Send + 'static,
    {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || operation(backend.as_ref()))
            .await
            .map_err(|error| MetaError::Internal(format!("metadata task join failed: {}", error)))?
    }

    fn cache_fill(&self, record: &MetaRecord) {
        if let Some(caches) = &self.caches {
            let mut caches = caches.lock().expect("metadata cache lock poisoned");
            caches.by_hash.put(record.hash.clone(), record.clone());
            caches
                .hash_by_id
                .put(record.storage_id.clone(), record.hash.clone());
        }
    }

    /// Read-through lookup by content hash.
    pub async fn get(&self, hash: &str) -> Result<Option<MetaRecord>> {
        if let Some(caches) = &self.caches {
            let mut caches = caches.lock().expect("metadata cache lock poisoned");
            if let Some(record) = caches.by_hash.get(hash) {
                return Ok(Some(record.clone()));
            }
        }

        let owned = hash.to_string();
        let record = self
            .run_blocking(move |backend| backend.query_by_hash(&owned))
            .await?;

        if let Some(record) = &record {
            self.cache_fill(record);
        }
        Ok(record)
    }

    /// Reverse lookup from storage id to hash.
    pub async fn hash_by_storage_id(&self, storage_id: &str) -> Result<Option<String>> {
        if let Some(caches) = &self.caches {
            let mut caches = caches.lock().expect("metadata cache lock poisoned");
            if let Some(hash) = caches.hash_by_id.get(storage_id) {
                return Ok(Some(hash.clone()));
            }
        }

        let owned = storage_id.to_string();
        let hash = self
            .run_blocking(move |backend| backend.query_hash_by_storage_id(&owned))
            .await?;

        if let Some(hash) = &hash {
            if let Some(caches) = &self.caches {
                caches
                    .lock()
                    .expect("metadata cache lock poisoned")
                    .hash_by_id
                    .put(storage_id.to_string(), hash.clone());
            }
        }
        Ok(hash)
    }

    /// Write-through commit: the backend persists first, the caches follow.
    /// A backend failure here surfaces as [`MetaError::Persistence`].
    pub async fn put(&self, record: MetaRecord) -> Result<()> {
        let persisted = record.clone();
        self.run_blocking(move |backend| backend.log_add_file(&persisted))
            .await
            .map_err(|error| MetaError::Persistence(error.to_string()))?;
        self.cache_fill(&record);
        Ok(())
    }

    pub async fn try_acquire_upload_lock(&self, hash: &str, node_id: &str) -> Result<bool> {
        let hash = hash.to_string();
        let node_id = node_id.to_string();
        self.run_blocking(move |backend| backend.try_acquire_upload_lock(&hash, &node_id))
            .await
    }

    pub async fn release_upload_lock(&self, hash: &str) -> Result<()> {
        let hash = hash.to_string();
        self.run_blocking(move |backend| backend.release_upload_lock(&hash))
            .await
    }

    /// Warm the cache from the backend at startup. Returns the number of
    /// records loaded.
    pub async fn preload(&self) -> Result<usize> {
        let records = self.run_blocking(|backend| backend.recover()).await?;
        for record in &records {
            self.cache_fill(record);
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_log::FileLogBackend;

    fn sample(hash: &str, id: &str) -> MetaRecord {
        MetaRecord {
            filename: "sample.bin".to_string(),
            hash: hash.to_string(),
            location: "10.0.0.2:5369".to_string(),
            storage_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn write_through_and_reverse_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend =
            Arc::new(FileLogBackend::open(dir.path().join("meta.log")).expect("backend"));
        let store = MetaStore::new(backend, CacheConfig::default());

        let record = sample(&"a".repeat(64), "id-a");
        store.put(record.clone()).await.expect("put");

        let fetched = store.get(&record.hash).await.expect("get").expect("present");
        assert_eq!(fetched, record);

        let hash = store
            .hash_by_storage_id("id-a")
            .await
            .expect("reverse")
            .expect("present");
        assert_eq!(hash, record.hash);

        assert!(store.get(&"b".repeat(64)).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn disabled_cache_still_serves_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend =
            Arc::new(FileLogBackend::open(dir.path().join("meta.log")).expect("backend"));
        let store = MetaStore::new(
            backend,
            CacheConfig {
                enabled: false,
                max_size: 0,
            },
        );

        let record = sample(&"c".repeat(64), "id-c");
        store.put(record.clone()).await.expect("put");
        assert_eq!(
            store.get(&record.hash).await.expect("get"),
            Some(record.clone())
        );
        assert_eq!(
            store.hash_by_storage_id("id-c").await.expect("reverse"),
            Some(record.hash)
        );
    }

    #[tokio::test]
    async fn preload_fills_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.log");
        {
            let backend = FileLogBackend::open(path.clone()).expect("backend");
            backend
                .log_add_file(&sample(&"d".repeat(64), "id-d"))
                .expect("seed");
        }

        let backend = Arc::new(FileLogBackend::open(path).expect("backend"));
        let store = MetaStore::new(backend, CacheConfig::default());
        assert_eq!(store.preload().await.expect("preload"), 1);
        assert!(store.get(&"d".repeat(64)).await.expect("get").is_some());
    }
}
