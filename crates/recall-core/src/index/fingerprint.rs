//! Change detection for log files
//!
//! A file needs reindexing unless both its content hash and its record
//! count match what was recorded the last time it was indexed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What the index remembers about a log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub file_path: String,
    pub content_hash: String,
    pub record_count: usize,
    pub last_indexed_at: DateTime<Utc>,
}

/// Hex SHA-256 of the content
pub fn fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Whether a file's current state differs from its stored fingerprint
pub fn needs_reindex(
    content: &[u8],
    record_count: usize,
    stored: Option<&FileFingerprint>,
) -> bool {
    match stored {
        None => true,
        Some(stored) => {
            stored.record_count != record_count || stored.content_hash != fingerprint(content)
        }
    }
}
