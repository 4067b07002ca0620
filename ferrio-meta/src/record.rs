//! The durable metadata triple plus its stable storage id.

use crate::error::{MetaError, Result};

/// One committed file: `(filename, content hash, data-service address)`
/// keyed by a caller-visible storage id. The same hash may appear under many
/// storage ids (identical content re-uploaded under different names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    pub filename: String,
    pub hash: String,
    pub location: String,
    pub storage_id: String,
}

impl MetaRecord {
    /// The persisted file-log line format is pipe-delimited with no
    /// escaping, so no field may contain `|`.
    pub fn validate_fields(&self) -> Result<()> {
        for (name, value) in [
            ("filename", &self.filename),
            ("hash", &self.hash),
            ("location", &self.location),
            ("storage_id", &self.storage_id),
        ] {
            if value.contains('|') {
                return Err(MetaError::MalformedRecord(format!(
                    "{} must not contain '|': {}",
                    name, value
                )));
            }
            if value.is_empty() {
                return Err(MetaError::MalformedRecord(format!("{} is empty", name)));
            }
        }
        Ok(())
    }
}
