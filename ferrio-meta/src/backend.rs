//! Backend contract shared by the file-log and relational stores.

use crate::error::Result;
use crate::record::MetaRecord;

/// Single capability set for metadata persistence; one implementation is
/// selected at startup. Methods are synchronous — callers run them on the
/// blocking pool so network reactors never wait on disk or the database.
pub trait MetadataBackend: Send + Sync {
    /// First record matching `hash`, if any.
    fn query_by_hash(&self, hash: &str) -> Result<Option<MetaRecord>>;

    /// Reverse lookup from a storage id to its content hash.
    fn query_hash_by_storage_id(&self, storage_id: &str) -> Result<Option<String>>;

    /// Durably append one committed record.
    fn log_add_file(&self, record: &MetaRecord) -> Result<()>;

    /// Cluster-wide single-writer gate per hash. `false` means another name
    /// service currently holds it.
    fn try_acquire_upload_lock(&self, hash: &str, node_id: &str) -> Result<bool>;

    fn release_upload_lock(&self, hash: &str) -> Result<()>;

    /// Load all persisted records at startup (cache warm-up).
    fn recover(&self) -> Result<Vec<MetaRecord>>;
}
