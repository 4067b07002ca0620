//! Ferrio Meta - metadata persistence and upload admission for name services

pub mod admission;
pub mod backend;
pub mod error;
pub mod file_log;
pub mod record;
pub mod sqlite;
pub mod store;

pub use admission::{
    AdmissionController, AdmissionDecision, CommitOutcome, PENDING_TTL, SEGMENTS,
};
pub use backend::MetadataBackend;
pub use error::{MetaError, Result};
pub use file_log::FileLogBackend;
pub use record::MetaRecord;
pub use sqlite::SqliteBackend;
pub use store::{CacheConfig, MetaStore};
