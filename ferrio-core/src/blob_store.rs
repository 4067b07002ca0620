//! Hash-addressed blob storage for the data service.
//!
//! A blob with hash `H` lives at `<root>/<H[0:2]>/<H[2:4]>/<H>`. Reads probe
//! every configured root in order; writes land in the root with the most
//! free space. Ingest goes through a per-connection unique temp file that is
//! renamed into place once the stream completes; the existence check and the
//! rename execute under one process-wide mutex so concurrent uploads of the
//! same hash converge on a single final file.

use crate::error::{FerrioError, Result};
use fs2::available_space;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const TMP_SUFFIX: &str = ".tmp";

/// Default age past which an orphaned temp file is reclaimed.
pub const GC_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Outcome of a completed ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    /// The final file already existed; the temp was discarded.
    Deduplicated,
}

pub struct BlobStore {
    roots: Vec<PathBuf>,
    rename_lock: Mutex<()>,
}

impl BlobStore {
    /// Open a store over the configured roots, creating and canonicalizing
    /// each one.
    pub fn open(roots: Vec<PathBuf>) -> Result<Self> {
        if roots.is_empty() {
            return Err(FerrioError::NoStorageRoot);
        }

        let mut canonical = Vec::with_capacity(roots.len());
        for root in roots {
            std::fs::create_dir_all(&root)?;
            canonical.push(root.canonicalize()?);
        }

        Ok(Self {
            roots: canonical,
            rename_lock: Mutex::new(()),
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Hashes are ASCII-alphanumeric only, which excludes `..`, separators
    /// and NUL by construction.
    pub fn validate_hash(hash: &str) -> Result<()> {
        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(FerrioError::InvalidHash(hash.to_string()));
        }
        Ok(())
    }

    fn shard(hash: &str) -> (&str, &str) {
        let first = if hash.len() >= 2 { &hash[0..2] } else { "00" };
        let second = if hash.len() >= 4 { &hash[2..4] } else { "00" };
        (first, second)
    }

    fn final_path_under(root: &Path, hash: &str) -> PathBuf {
        let (first, second) = Self::shard(hash);
        root.join(first).join(second).join(hash)
    }

    fn guard_under_root(path: &Path, root: &Path) -> Result<()> {
        if !path.starts_with(root) {
            return Err(FerrioError::PathEscape(path.display().to_string()));
        }
        Ok(())
    }

    /// Find an existing blob, probing roots in configuration order.
    pub fn locate(&self, hash: &str) -> Result<Option<PathBuf>> {
        Self::validate_hash(hash)?;

        for root in &self.roots {
            let candidate = Self::final_path_under(root, hash);
            Self::guard_under_root(&candidate, root)?;
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn free_space_of(root: &Path) -> i64 {
        match available_space(root) {
            Ok(space) => i64::try_from(space).unwrap_or(i64::MAX),
            Err(error) => {
                tracing::warn!("free-space probe failed for {}: {}", root.display(), error);
                0
            }
        }
    }

    /// Advertised free space: the sum over all roots.
    pub fn total_free_space(&self) -> i64 {
        self.roots
            .iter()
            .map(|root| Self::free_space_of(root))
            .fold(0i64, |acc, space| acc.saturating_add(space))
    }

    fn write_root(&self) -> &Path {
        self.roots
            .iter()
            .max_by_key(|root| Self::free_space_of(root))
            .expect("roots are non-empty by construction")
            .as_path()
    }

    /// Start an ingest for `hash` expecting `expected` stream bytes. Creates
    /// the shard directories and a unique temp file next to the final path.
    pub async fn begin_ingest(&self, hash: &str, expected: u64) -> Result<TempUpload> {
        Self::validate_hash(hash)?;

        let root = self.write_root();
        let final_path = Self::final_path_under(root, hash);
        Self::guard_under_root(&final_path, root)?;

        let final_dir = final_path
            .parent()
            .ok_or_else(|| FerrioError::Internal("blob path has no parent".to_string()))?;
        fs::create_dir_all(final_dir).await?;

        let tmp_name = format!("{}.{}{}", hash, ulid::Ulid::new(), TMP_SUFFIX);
        let tmp_path = final_dir.join(tmp_name);
        let file = fs::File::create(&tmp_path).await?;

        Ok(TempUpload {
            hash: hash.to_string(),
            tmp_path,
            final_path,
            file: Some(file),
            expected,
            received: 0,
        })
    }

    /// Complete an ingest: fsync the temp, then check-and-rename under the
    /// store-wide mutex.
    pub async fn finish(&self, mut upload: TempUpload) -> Result<IngestOutcome> {
        if upload.received != upload.expected {
            upload.abort().await;
            return Err(FerrioError::Internal(format!(
                "ingest of {} finished at {} of {} bytes",
                upload.hash, upload.received, upload.expected
            )));
        }

        if let Some(mut file) = upload.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let _guard = self.rename_lock.lock().await;

        if upload.final_path.is_file() {
            fs::remove_file(&upload.tmp_path).await?;
            return Ok(IngestOutcome::Deduplicated);
        }

        match fs::rename(&upload.tmp_path, &upload.final_path).await {
            Ok(()) => Ok(IngestOutcome::Stored),
            Err(rename_error) => {
                let _ = fs::remove_file(&upload.tmp_path).await;
                // A concurrent ingest may have won the rename on a path the
                // probe above did not cover.
                if upload.final_path.is_file() {
                    Ok(IngestOutcome::Deduplicated)
                } else {
                    Err(rename_error.into())
                }
            }
        }
    }

    /// Remove `.tmp` orphans older than `max_age` across every root.
    /// Returns the number of files removed.
    pub async fn gc_once(&self, max_age: Duration) -> Result<usize> {
        let roots = self.roots.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let cutoff = SystemTime::now() - max_age;
            let mut removed = 0usize;
            for root in &roots {
                if let Err(error) = sweep_tmp_files(root, cutoff, &mut removed) {
                    tracing::warn!("gc sweep failed under {}: {}", root.display(), error);
                }
            }
            removed
        })
        .await
        .map_err(|error| FerrioError::Internal(format!("gc task join failed: {}", error)))?;

        Ok(removed)
    }
}

fn sweep_tmp_files(dir: &Path, cutoff: SystemTime, removed: &mut usize) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            sweep_tmp_files(&path, cutoff, removed)?;
            continue;
        }

        if !file_type.is_file()
            || !path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(TMP_SUFFIX))
                .unwrap_or(false)
        {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        if modified <= cutoff {
            tracing::info!("gc removing stale temp file {}", path.display());
            std::fs::remove_file(&path)?;
            *removed += 1;
        }
    }
    Ok(())
}

/// An in-flight ingest: the open temp file plus its bookkeeping. Dropped
/// uploads leave the temp behind for GC; disconnect paths call [`TempUpload::abort`].
pub struct TempUpload {
    hash: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<fs::File>,
    expected: u64,
    received: u64,
}

impl TempUpload {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| FerrioError::Internal("write after ingest closed".to_string()))?;
        file.write_all(chunk).await?;
        self.received += chunk.len() as u64;
        Ok(())
    }

    /// Drop the writer and delete the temp file.
    pub async fn abort(&mut self) {
        self.file.take();
        if let Err(error) = fs::remove_file(&self.tmp_path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "failed to remove temp file {}: {}",
                    self.tmp_path.display(),
                    error
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::compute_hash;

    async fn ingest(store: &BlobStore, hash: &str, body: &[u8]) -> Result<IngestOutcome> {
        let mut upload = store.begin_ingest(hash, body.len() as u64).await?;
        upload.write_chunk(body).await?;
        store.finish(upload).await
    }

    #[tokio::test]
    async fn ingest_roundtrip_and_dedup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(vec![dir.path().to_path_buf()]).expect("store");

        let body = b"ferrio blob body";
        let hash = compute_hash(body);

        let first = ingest(&store, &hash, body).await.expect("first ingest");
        assert_eq!(first, IngestOutcome::Stored);

        let path = store.locate(&hash).expect("locate").expect("present");
        assert_eq!(std::fs::read(&path).expect("read back"), body);
        assert!(path.ends_with(format!("{}/{}/{}", &hash[0..2], &hash[2..4], hash)));

        let second = ingest(&store, &hash, body).await.expect("second ingest");
        assert_eq!(second, IngestOutcome::Deduplicated);

        // No temp files survive either path.
        let mut removed = 0usize;
        sweep_tmp_files(dir.path(), SystemTime::now(), &mut removed).expect("sweep");
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn concurrent_identical_ingests_converge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = std::sync::Arc::new(
            BlobStore::open(vec![dir.path().to_path_buf()]).expect("store"),
        );

        let body: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 256) as u8).collect();
        let hash = compute_hash(&body);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let hash = hash.clone();
            let body = body.clone();
            tasks.push(tokio::spawn(async move {
                ingest(&store, &hash, &body).await
            }));
        }

        let mut stored = 0;
        for task in tasks {
            match task.await.expect("join").expect("ingest") {
                IngestOutcome::Stored => stored += 1,
                IngestOutcome::Deduplicated => {}
            }
        }
        assert_eq!(stored, 1);

        let path = store.locate(&hash).expect("locate").expect("present");
        assert_eq!(std::fs::read(path).expect("read"), body);
    }

    #[tokio::test]
    async fn rejects_traversal_hashes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(vec![dir.path().to_path_buf()]).expect("store");

        for bad in ["../secret", "a/b", "a\\b", "", "café", "ab\0cd"] {
            assert!(matches!(
                store.locate(bad),
                Err(FerrioError::InvalidHash(_))
            ));
            assert!(store.begin_ingest(bad, 1).await.is_err());
        }

        // Nothing was created outside or inside the root.
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[tokio::test]
    async fn aborted_upload_removes_temp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(vec![dir.path().to_path_buf()]).expect("store");

        let hash = compute_hash(b"partial");
        let mut upload = store.begin_ingest(&hash, 100).await.expect("begin");
        upload.write_chunk(b"only-some-bytes").await.expect("write");
        upload.abort().await;

        let mut removed = 0usize;
        sweep_tmp_files(dir.path(), SystemTime::now(), &mut removed).expect("sweep");
        assert_eq!(removed, 0);
        assert!(store.locate(&hash).expect("locate").is_none());
    }

    #[tokio::test]
    async fn gc_reclaims_stale_temps_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(vec![dir.path().to_path_buf()]).expect("store");

        let hash = compute_hash(b"orphan");
        let mut upload = store.begin_ingest(&hash, 10).await.expect("begin");
        upload.write_chunk(b"abc").await.expect("write");
        // Simulate a crashed writer: drop without abort.
        drop(upload);

        // Fresh temps survive a sweep with the production threshold.
        assert_eq!(store.gc_once(GC_MAX_AGE).await.expect("gc"), 0);
        // A zero threshold reclaims them.
        assert_eq!(store.gc_once(Duration::ZERO).await.expect("gc"), 1);
    }

    #[tokio::test]
    async fn locate_probes_roots_in_order() {
        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");

        let hash = compute_hash(b"second-root-blob");
        let shard = second
            .path()
            .join(&hash[0..2])
            .join(&hash[2..4]);
        std::fs::create_dir_all(&shard).expect("mkdirs");
        std::fs::write(shard.join(&hash), b"second-root-blob").expect("write");

        let store = BlobStore::open(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ])
        .expect("store");

        let found = store.locate(&hash).expect("locate").expect("present");
        assert!(found.starts_with(second.path().canonicalize().expect("canonical")));
    }

    #[tokio::test]
    async fn short_circuit_on_size_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(vec![dir.path().to_path_buf()]).expect("store");

        let hash = compute_hash(b"undersized");
        let mut upload = store.begin_ingest(&hash, 10).await.expect("begin");
        upload.write_chunk(b"abc").await.expect("write");
        assert!(store.finish(upload).await.is_err());
        assert!(store.locate(&hash).expect("locate").is_none());
    }
}
