//! Pre-upload admission and commit.
//!
//! The controller serializes all decisions about one content hash behind a
//! fixed array of segment locks. The in-memory pending set is the local
//! single-writer gate; the backend's upload-lock table extends it across
//! name services. Store calls issued while a segment lock is held are
//! bounded so a slow backend cannot wedge a segment.

use crate::error::{MetaError, Result};
use crate::record::MetaRecord;
use crate::store::MetaStore;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const SEGMENTS: usize = 128;

/// An admission that never commits expires after this long.
pub const PENDING_TTL: Duration = Duration::from_secs(10 * 60);

pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Bound on store calls made while a segment lock is held.
const STORE_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Reply to a `PRE_UPLOAD` probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Content already committed; dedup short-circuit with its location.
    Exists(MetaRecord),
    /// Caller may upload; it now holds the admission for this hash.
    Allow,
    /// Another uploader holds the hash; retry later.
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub storage_id: String,
    /// True when an earlier commit already registered this hash and the
    /// existing id was returned (idempotent replay).
    pub already_existed: bool,
}

pub struct AdmissionController {
    store: Arc<MetaStore>,
    node_id: String,
    pending: Mutex<HashMap<String, Instant>>,
    segments: Vec<tokio::sync::Mutex<()>>,
}

impl AdmissionController {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self {
            store,
            node_id: Uuid::new_v4().to_string(),
            pending: Mutex::new(HashMap::new()),
            segments: (0..SEGMENTS).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    fn segment(&self, hash: &str) -> &tokio::sync::Mutex<()> {
        let mut hasher = DefaultHasher::new();
        hash.hash(&mut hasher);
        &self.segments[(hasher.finish() % SEGMENTS as u64) as usize]
    }

    async fn bounded<T>(&self, what: &str, future: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(STORE_CALL_TIMEOUT, future).await {
            Ok(result) => result,
            Err(_) => Err(MetaError::Timeout(what.to_string())),
        }
    }

    fn pending_contains(&self, hash: &str) -> bool {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .contains_key(hash)
    }

    fn pending_insert(&self, hash: &str) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(hash.to_string(), Instant::now());
    }

    fn pending_remove(&self, hash: &str) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(hash);
    }

    async fn release_cluster_lock_best_effort(&self, hash: &str) {
        if let Err(error) = self.store.release_upload_lock(hash).await {
            tracing::warn!("failed to release upload lock for {}: {}", hash, error);
        }
    }

    /// Decide a `PRE_UPLOAD` for `hash`.
    pub async fn pre_upload(&self, hash: &str) -> Result<AdmissionDecision> {
        let _segment = self.segment(hash).lock().await;

        if let Some(record) = self.bounded("query_by_hash", self.store.get(hash)).await? {
            return Ok(AdmissionDecision::Exists(record));
        }

        let acquired = self
            .bounded(
                "try_acquire_upload_lock",
                self.store.try_acquire_upload_lock(hash, &self.node_id),
            )
            .await?;
        if !acquired {
            tracing::info!("upload lock held elsewhere, waiting: hash={}", hash);
            return Ok(AdmissionDecision::Wait);
        }

        if self.pending_contains(hash) {
            // A local uploader already won; hand the cluster lock back.
            self.release_cluster_lock_best_effort(hash).await;
            tracing::info!("concurrent upload in flight, waiting: hash={}", hash);
            return Ok(AdmissionDecision::Wait);
        }

        self.pending_insert(hash);
        tracing::info!("upload admitted: hash={}", hash);
        Ok(AdmissionDecision::Allow)
    }

    /// Commit `(filename, hash, location)` and hand out the storage id.
    /// Whatever the outcome, the hash leaves the pending set; any failure
    /// also releases the cluster lock before the error surfaces.
    pub async fn commit(
        &self,
        filename: &str,
        hash: &str,
        location: &str,
    ) -> Result<CommitOutcome> {
        let _segment = self.segment(hash).lock().await;

        let result = self.commit_locked(filename, hash, location).await;
        if result.is_err() {
            self.pending_remove(hash);
            self.release_cluster_lock_best_effort(hash).await;
        }
        result
    }

    async fn commit_locked(
        &self,
        filename: &str,
        hash: &str,
        location: &str,
    ) -> Result<CommitOutcome> {
        if let Some(existing) = self.bounded("query_by_hash", self.store.get(hash)).await? {
            self.pending_remove(hash);
            tracing::info!(
                "duplicate commit ignored: hash={} id={}",
                hash,
                existing.storage_id
            );
            return Ok(CommitOutcome {
                storage_id: existing.storage_id,
                already_existed: true,
            });
        }

        self.pending_remove(hash);

        let record = MetaRecord {
            filename: filename.to_string(),
            hash: hash.to_string(),
            location: location.to_string(),
            storage_id: Uuid::new_v4().to_string(),
        };

        let outcome = self
            .bounded("log_add_file", self.store.put(record.clone()))
            .await;
        outcome.map(|()| {
            tracing::info!(
                "file registered: {} id={} at {}",
                record.filename,
                record.storage_id,
                record.location
            );
            CommitOutcome {
                storage_id: record.storage_id,
                already_existed: false,
            }
        })
    }

    /// Read-only dedup probe; never touches admission state.
    pub async fn check_existence(&self, hash: &str) -> Result<Option<MetaRecord>> {
        self.store.get(hash).await
    }

    /// Resolve a download request: storage id first, falling back to
    /// treating the id as a raw hash for old callers.
    pub async fn resolve_download(&self, id: &str) -> Result<Option<MetaRecord>> {
        let hash = match self.store.hash_by_storage_id(id).await? {
            Some(hash) => hash,
            None => id.to_string(),
        };
        self.store.get(&hash).await
    }

    /// Remove pending entries older than `ttl`; returns how many fell out.
    pub fn sweep_pending(&self, ttl: Duration) -> usize {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let before = pending.len();
        pending.retain(|_, created| created.elapsed() <= ttl);
        before - pending.len()
    }

    /// Periodic hygiene for admissions whose uploader vanished.
    pub fn spawn_pending_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PENDING_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let swept = controller.sweep_pending(PENDING_TTL);
                if swept > 0 {
                    tracing::info!("expired {} stale upload admissions", swept);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_log::FileLogBackend;
    use crate::sqlite::SqliteBackend;
    use crate::store::{CacheConfig, MetaStore};

    fn file_controller(dir: &tempfile::TempDir) -> Arc<AdmissionController> {
        let backend =
            Arc::new(FileLogBackend::open(dir.path().join("meta.log")).expect("backend"));
        Arc::new(AdmissionController::new(Arc::new(MetaStore::new(
            backend,
            CacheConfig::default(),
        ))))
    }

    #[tokio::test]
    async fn ten_way_race_admits_exactly_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = file_controller(&dir);
        let hash = "a".repeat(64);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let controller = controller.clone();
            let hash = hash.clone();
            tasks.push(tokio::spawn(
                async move { controller.pre_upload(&hash).await },
            ));
        }

        let mut allows = 0;
        let mut waits = 0;
        for task in tasks {
            match task.await.expect("join").expect("decision") {
                AdmissionDecision::Allow => allows += 1,
                AdmissionDecision::Wait => waits += 1,
                AdmissionDecision::Exists(_) => panic!("nothing committed yet"),
            }
        }
        assert_eq!(allows, 1);
        assert_eq!(waits, 9);

        // The winner commits; every retry now sees the dedup short-circuit.
        let outcome = controller
            .commit("report.pdf", &hash, "10.0.0.2:5369")
            .await
            .expect("commit");
        assert!(!outcome.already_existed);

        for _ in 0..9 {
            match controller.pre_upload(&hash).await.expect("retry") {
                AdmissionDecision::Exists(record) => {
                    assert_eq!(record.location, "10.0.0.2:5369");
                    assert_eq!(record.storage_id, outcome.storage_id);
                }
                other => panic!("expected Exists, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = file_controller(&dir);
        let hash = "b".repeat(64);

        assert_eq!(
            controller.pre_upload(&hash).await.expect("pre"),
            AdmissionDecision::Allow
        );

        let first = controller
            .commit("one.bin", &hash, "10.0.0.2:5369")
            .await
            .expect("commit");
        let second = controller
            .commit("two.bin", &hash, "10.0.0.3:5369")
            .await
            .expect("replay");

        assert!(!first.already_existed);
        assert!(second.already_existed);
        assert_eq!(first.storage_id, second.storage_id);
    }

    #[tokio::test]
    async fn pending_expires_via_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = file_controller(&dir);
        let hash = "c".repeat(64);

        assert_eq!(
            controller.pre_upload(&hash).await.expect("pre"),
            AdmissionDecision::Allow
        );
        assert_eq!(
            controller.pre_upload(&hash).await.expect("pre again"),
            AdmissionDecision::Wait
        );

        // The uploader vanished; a sweep frees the hash for the next caller.
        assert_eq!(controller.sweep_pending(Duration::ZERO), 1);
        assert_eq!(
            controller.pre_upload(&hash).await.expect("after sweep"),
            AdmissionDecision::Allow
        );
    }

    #[tokio::test]
    async fn failed_persist_releases_cluster_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend =
            Arc::new(SqliteBackend::open(dir.path().join("meta.sqlite3")).expect("backend"));
        let node_a = Arc::new(AdmissionController::new(Arc::new(MetaStore::new(
            backend.clone(),
            CacheConfig::default(),
        ))));
        let node_b = Arc::new(AdmissionController::new(Arc::new(MetaStore::new(
            backend,
            CacheConfig::default(),
        ))));

        let hash = "d".repeat(64);
        assert_eq!(
            node_a.pre_upload(&hash).await.expect("pre"),
            AdmissionDecision::Allow
        );
        // While node A holds the cluster row, node B has to wait.
        assert_eq!(
            node_b.pre_upload(&hash).await.expect("pre"),
            AdmissionDecision::Wait
        );

        // A filename with a pipe fails validation inside the persist step.
        let failed = node_a.commit("bad|name", &hash, "10.0.0.2:5369").await;
        assert!(failed.is_err());

        // The lock was rolled back, so node B can take over immediately.
        assert_eq!(
            node_b.pre_upload(&hash).await.expect("takeover"),
            AdmissionDecision::Allow
        );
    }

    #[tokio::test]
    async fn resolve_download_falls_back_to_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = file_controller(&dir);
        let hash = "e".repeat(64);

        controller.pre_upload(&hash).await.expect("pre");
        let outcome = controller
            .commit("legacy.bin", &hash, "10.0.0.2:5369")
            .await
            .expect("commit");

        let by_id = controller
            .resolve_download(&outcome.storage_id)
            .await
            .expect("resolve")
            .expect("present");
        assert_eq!(by_id.hash, hash);

        let by_hash = controller
            .resolve_download(&hash)
            .await
            .expect("resolve")
            .expect("present");
        assert_eq!(by_hash.storage_id, outcome.storage_id);

        assert!(controller
            .resolve_download("missing-id")
            .await
            .expect("resolve")
            .is_none());
    }
}
