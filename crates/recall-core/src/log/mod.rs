//! Append-only memory log
//!
//! Records are stored one JSON object per line in day-partitioned files.
//! Each record is addressed by (file, physical line). Appends to the same
//! file are serialized so two writers can never be handed the same line.

pub mod layout;
pub mod record;

pub use layout::{absolute_root, infer_workspace, is_log_file, list_log_files, log_path_for};
pub use record::{AddressedRecord, LogAddress, MemoryRecord};

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{RecallError, Result};

/// Raw bytes of a log file plus the records parsed from exactly those bytes
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub content: Vec<u8>,
    pub records: Vec<AddressedRecord>,
}

/// File size and line count right after the last append through this log
#[derive(Debug, Clone, Copy)]
struct AppendCursor {
    len: u64,
    lines: usize,
}

/// Date-partitioned append-only log rooted at a directory
pub struct EventLog {
    root: PathBuf,
    /// One lock per file, created on first use and never removed. It also
    /// caches where the next append lands.
    append_locks: DashMap<PathBuf, Arc<Mutex<Option<AppendCursor>>>>,
}

impl EventLog {
    /// The root is made absolute so every path handed out for a file is
    /// spelled the same way, whatever the working directory later becomes.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: absolute_root(root),
            append_locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<Option<AppendCursor>>> {
        self.append_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Append a record to its day's file and return its address
    pub async fn append(&self, record: &MemoryRecord) -> Result<LogAddress> {
        let path = log_path_for(&self.root, record.timestamp.date_naive());
        let lock = self.lock_for(&path);
        let mut cursor = lock.lock().await;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let on_disk = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        // The cached count is only trusted while nobody else touched the file
        let (line_number, unterminated) = match *cursor {
            Some(c) if c.len == on_disk => (c.lines, false),
            _ => {
                let existing = match fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                (
                    count_lines(&existing),
                    existing.last().is_some_and(|b| *b != b'\n'),
                )
            }
        };

        let mut payload = String::new();
        // A crash mid-write can leave an unterminated tail; close it so it
        // stays its own (corrupt) line instead of swallowing this record.
        if unterminated {
            payload.push('\n');
        }
        payload.push_str(&serde_json::to_string(record)?);
        payload.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.sync_data().await?;
        let len = file.metadata().await?.len();
        *cursor = Some(AppendCursor {
            len,
            lines: line_number + 1,
        });

        debug!(
            path = %path.display(),
            line = line_number,
            record_type = %record.record_type,
            "Appended memory record"
        );

        Ok(LogAddress::new(path, line_number))
    }

    /// Read the record at a physical line.
    ///
    /// Returns `None` for out-of-range, blank, or unparseable lines.
    pub async fn read_at(&self, path: &Path, line_number: usize) -> Result<Option<MemoryRecord>> {
        let content = read_log(path).await?;
        let text = String::from_utf8_lossy(&content);

        Ok(text
            .lines()
            .nth(line_number)
            .and_then(|line| parse_line(path, line_number, line)))
    }

    /// Read every well-formed record in a file, in order
    pub async fn read_all(&self, path: &Path) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .read_all_addressed(path)
            .await?
            .into_iter()
            .map(|r| r.record)
            .collect())
    }

    /// Read every well-formed record paired with its address
    pub async fn read_all_addressed(&self, path: &Path) -> Result<Vec<AddressedRecord>> {
        Ok(self.snapshot(path).await?.records)
    }

    /// Read a file's bytes and parse them under the file's append lock, so
    /// the hash and the records always describe the same content.
    pub async fn snapshot(&self, path: &Path) -> Result<LogSnapshot> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let content = read_log(path).await?;
        let records = parse_records(path, &content);
        Ok(LogSnapshot { content, records })
    }

    /// All day logs under the root, oldest first
    pub fn list_log_files(&self) -> Vec<PathBuf> {
        layout::list_log_files(&self.root)
    }
}

async fn read_log(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RecallError::NotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Physical line count, counting an unterminated tail as a line
fn count_lines(content: &[u8]) -> usize {
    let newlines = content.iter().filter(|b| **b == b'\n').count();
    match content.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

fn parse_records(path: &Path, content: &[u8]) -> Vec<AddressedRecord> {
    let text = String::from_utf8_lossy(content);
    text.lines()
        .enumerate()
        .filter_map(|(line_number, line)| {
            parse_line(path, line_number, line).map(|record| AddressedRecord {
                address: LogAddress::new(path, line_number),
                record,
            })
        })
        .collect()
}

fn parse_line(path: &Path, line_number: usize, line: &str) -> Option<MemoryRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<MemoryRecord>(line) {
        Ok(record) => Some(record),
        Err(e) => {
            let err = RecallError::CorruptRecord {
                path: path.to_path_buf(),
                line: line_number,
                reason: e.to_string(),
            };
            warn!("Skipping log line: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record_at(content: &str, day: u32) -> MemoryRecord {
        MemoryRecord::new("note", "test", content)
            .with_timestamp(Utc.with_ymd_and_hms(2025, 1, day, 8, 30, 0).unwrap())
    }

    #[tokio::test]
    async fn test_sequential_appends_get_dense_lines() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());

        for i in 0..5 {
            let addr = log.append(&record_at(&format!("m{}", i), 1)).await.unwrap();
            assert_eq!(addr.line_number, i);
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_unique_lines() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(EventLog::new(dir.path()));

        let tasks = (0..40).map(|i| {
            let log = log.clone();
            tokio::spawn(async move { log.append(&record_at(&format!("m{}", i), 2)).await })
        });
        let mut lines: Vec<usize> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().line_number)
            .collect();
        lines.sort_unstable();

        assert_eq!(lines, (0..40).collect::<Vec<_>>());

        let path = log_path_for(dir.path(), Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap().date_naive());
        assert_eq!(log.read_all(&path).await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_round_trip_read_at() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());

        let record = record_at("fixed null check", 3).with_workspace("/work/app");
        let addr = log.append(&record).await.unwrap();

        let read = log.read_at(&addr.file_path, addr.line_number).await.unwrap();
        assert_eq!(read, Some(record));
    }

    #[tokio::test]
    async fn test_read_at_out_of_range_is_none() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());
        let addr = log.append(&record_at("only", 4)).await.unwrap();

        assert!(log.read_at(&addr.file_path, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());
        let missing = dir.path().join("memories/2025-01-09/memories.log");

        assert!(matches!(
            log.read_all(&missing).await,
            Err(RecallError::NotFound(_))
        ));
        assert!(matches!(
            log.read_at(&missing, 0).await,
            Err(RecallError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());
        let first = log.append(&record_at("first", 5)).await.unwrap();

        let mut raw = std::fs::read_to_string(&first.file_path).unwrap();
        raw.push_str("{not json at all\n\n");
        std::fs::write(&first.file_path, raw).unwrap();

        let second = log.append(&record_at("second", 5)).await.unwrap();
        assert_eq!(second.line_number, 3);

        let records = log.read_all_addressed(&first.file_path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record.content, "first");
        assert_eq!(records[1].record.content, "second");
        assert_eq!(records[1].address.line_number, 3);
        assert!(log.read_at(&first.file_path, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unterminated_tail_keeps_its_own_line() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());
        let first = log.append(&record_at("first", 6)).await.unwrap();

        let mut raw = std::fs::read_to_string(&first.file_path).unwrap();
        raw.push_str(r#"{"type":"note","sou"#);
        std::fs::write(&first.file_path, raw).unwrap();

        let next = log.append(&record_at("after crash", 6)).await.unwrap();
        assert_eq!(next.line_number, 2);

        let read = log.read_at(&next.file_path, 2).await.unwrap().unwrap();
        assert_eq!(read.content, "after crash");
    }

    #[tokio::test]
    async fn test_external_append_between_appends_is_counted() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());
        let first = log.append(&record_at("ours", 9)).await.unwrap();

        let mut raw = std::fs::read_to_string(&first.file_path).unwrap();
        raw.push_str(&serde_json::to_string(&record_at("theirs", 9)).unwrap());
        raw.push('\n');
        std::fs::write(&first.file_path, raw).unwrap();

        let next = log.append(&record_at("ours again", 9)).await.unwrap();
        assert_eq!(next.line_number, 2);
        let again = log.append(&record_at("and again", 9)).await.unwrap();
        assert_eq!(again.line_number, 3);

        let read = log.read_at(&first.file_path, 3).await.unwrap().unwrap();
        assert_eq!(read.content, "and again");
    }

    #[test]
    fn test_relative_root_is_made_absolute() {
        let log = EventLog::new("relative/recall");
        assert!(log.root().is_absolute());
        assert!(log.root().ends_with("relative/recall"));
    }

    #[tokio::test]
    async fn test_different_days_use_different_files() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());

        let a = log.append(&record_at("day seven", 7)).await.unwrap();
        let b = log.append(&record_at("day eight", 8)).await.unwrap();

        assert_ne!(a.file_path, b.file_path);
        assert_eq!(a.line_number, 0);
        assert_eq!(b.line_number, 0);
        assert_eq!(log.list_log_files(), vec![a.file_path, b.file_path]);
    }
}
