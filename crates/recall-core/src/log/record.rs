//! Memory record types and log addressing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single memory as persisted in the log (one JSON object per line)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Category label, e.g. "bug-fix" or "decision"
    #[serde(rename = "type")]
    pub record_type: String,
    /// Who produced the memory (agent, tool, user)
    pub source: String,
    pub content: String,
    /// Workspace the memory belongs to. Older records predate this field.
    #[serde(
        rename = "workspace_path",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub workspace: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    /// Create a record stamped with the current time
    pub fn new(
        record_type: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            source: source.into(),
            content: content.into(),
            workspace: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Stable location of a record: physical line within a log file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogAddress {
    pub file_path: PathBuf,
    /// 0-indexed physical line. Blank and corrupt lines occupy a number too.
    pub line_number: usize,
}

impl LogAddress {
    pub fn new(file_path: impl Into<PathBuf>, line_number: usize) -> Self {
        Self {
            file_path: file_path.into(),
            line_number,
        }
    }
}

/// A parsed record together with the address it was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedRecord {
    pub address: LogAddress,
    pub record: MemoryRecord,
}
