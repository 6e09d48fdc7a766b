//! Vector index over memory records
//!
//! SQLite with the sqlite-vec `vec0` table for k-NN. Entry metadata lives in
//! a plain table keyed by the same rowid, so filtering and bulk deletes never
//! depend on what the virtual table supports. Everything here is derived data:
//! dropping the file and re-running a sweep rebuilds it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::{debug, info};

use super::fingerprint::FileFingerprint;
use crate::error::{RecallError, Result};

/// Default candidate multiplier for workspace-filtered searches
pub const DEFAULT_OVERFETCH_FACTOR: usize = 10;

/// Largest `k` a vec0 KNN query accepts
const MAX_KNN: usize = 4096;

/// Register sqlite-vec for every connection opened afterwards
fn ensure_sqlite_vec_loaded() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // SAFETY: `sqlite3_vec_init` is the statically linked extension entry
        // point; registering it as an auto-extension is how sqlite-vec is
        // meant to be enabled from Rust.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
    });
}

/// A nearest-neighbour hit, resolvable back to a log record
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub workspace: String,
    pub file_path: PathBuf,
    pub line_number: usize,
    pub distance: f64,
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite + sqlite-vec index of (embedding, workspace, file, line)
pub struct IndexStore {
    location: Location,
    dimension: usize,
    overfetch_factor: usize,
    /// `None` until `initialize()`; also serializes every reader and writer
    conn: Mutex<Option<Connection>>,
}

impl IndexStore {
    /// Index persisted at `path`. Call `initialize()` before use.
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Self {
        Self::with_location(Location::File(path.into()), dimension)
    }

    /// Throwaway in-memory index
    pub fn in_memory(dimension: usize) -> Self {
        Self::with_location(Location::Memory, dimension)
    }

    fn with_location(location: Location, dimension: usize) -> Self {
        Self {
            location,
            dimension,
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
            conn: Mutex::new(None),
        }
    }

    pub fn with_overfetch_factor(mut self, factor: usize) -> Self {
        self.overfetch_factor = factor.max(1);
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Open the database and create tables. Safe to call more than once.
    pub fn initialize(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        if guard.is_some() {
            return Ok(());
        }

        ensure_sqlite_vec_loaded();
        let conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            Location::Memory => Connection::open_in_memory()?,
        };

        apply_schema(&conn, self.dimension)?;
        check_dimension(&conn, self.dimension)?;

        info!(
            location = ?self.location,
            dimension = self.dimension,
            "Index store initialized"
        );
        *guard = Some(conn);
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(RecallError::NotInitialized)?;
        f(conn)
    }

    /// Add one entry. Callers remove stale entries first; duplicates are not checked.
    pub fn insert(
        &self,
        embedding: &[f32],
        workspace: &str,
        file_path: &Path,
        line_number: usize,
    ) -> Result<()> {
        self.with_conn(|conn| {
            if embedding.len() != self.dimension {
                return Err(RecallError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }

            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO memory_entries (workspace, file_path, line_number)
                 VALUES (?1, ?2, ?3)",
                params![workspace, path_key(file_path), line_number as i64],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO memory_vectors (rowid, embedding) VALUES (?1, ?2)",
                params![id, embedding_to_blob(embedding)],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Nearest entries by ascending distance, at most `k`.
    ///
    /// With a workspace filter the KNN query over-fetches and filters
    /// afterwards, so a sparse workspace can yield fewer than `k` hits.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        workspace: Option<&str>,
    ) -> Result<Vec<IndexHit>> {
        self.with_conn(|conn| {
            if query.len() != self.dimension {
                return Err(RecallError::DimensionMismatch {
                    expected: self.dimension,
                    actual: query.len(),
                });
            }
            if k == 0 {
                return Ok(Vec::new());
            }

            let fetch = match workspace {
                Some(_) => k.saturating_mul(self.overfetch_factor),
                None => k,
            }
            .min(MAX_KNN);

            let mut stmt = conn.prepare(
                "WITH knn AS (
                    SELECT rowid, distance FROM memory_vectors
                    WHERE embedding MATCH ?1 AND k = ?2
                 )
                 SELECT e.workspace, e.file_path, e.line_number, knn.distance
                 FROM knn JOIN memory_entries e ON e.id = knn.rowid
                 ORDER BY knn.distance",
            )?;

            let rows = stmt.query_map(params![embedding_to_blob(query), fetch as i64], |row| {
                let workspace: String = row.get(0)?;
                let file_path: String = row.get(1)?;
                let line_number: i64 = row.get(2)?;
                let distance: f64 = row.get(3)?;
                Ok(IndexHit {
                    workspace,
                    file_path: PathBuf::from(file_path),
                    line_number: line_number as usize,
                    distance,
                })
            })?;

            let mut hits = Vec::new();
            for row in rows {
                let hit = row?;
                if workspace.is_some_and(|ws| ws != hit.workspace) {
                    continue;
                }
                hits.push(hit);
                if hits.len() == k {
                    break;
                }
            }

            debug!(
                k,
                fetched = fetch,
                returned = hits.len(),
                workspace = workspace.unwrap_or("*"),
                "Index search"
            );
            Ok(hits)
        })
    }

    /// Remove every entry for a log file
    pub fn delete_by_file(&self, file_path: &Path) -> Result<usize> {
        self.delete_where("file_path", &path_key(file_path))
    }

    /// Remove every entry for a workspace
    pub fn delete_by_workspace(&self, workspace: &str) -> Result<usize> {
        self.delete_where("workspace", workspace)
    }

    /// Remove the entry (or entries) pointing at one log line
    pub fn delete_by_address(&self, file_path: &Path, line_number: usize) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM memory_entries WHERE file_path = ?1 AND line_number = ?2",
                )?;
                let rows = stmt.query_map(
                    params![path_key(file_path), line_number as i64],
                    |row| row.get(0),
                )?;
                rows.collect::<std::result::Result<_, _>>()?
            };

            for id in &ids {
                tx.execute("DELETE FROM memory_vectors WHERE rowid = ?1", [id])?;
                tx.execute("DELETE FROM memory_entries WHERE id = ?1", [id])?;
            }
            tx.commit()?;
            Ok(ids.len())
        })
    }

    fn delete_where(&self, column: &'static str, value: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let ids: Vec<i64> = {
                let mut stmt =
                    tx.prepare(&format!("SELECT id FROM memory_entries WHERE {} = ?1", column))?;
                let rows = stmt.query_map([value], |row| row.get(0))?;
                rows.collect::<std::result::Result<_, _>>()?
            };

            for id in &ids {
                tx.execute("DELETE FROM memory_vectors WHERE rowid = ?1", [id])?;
            }
            tx.execute(
                &format!("DELETE FROM memory_entries WHERE {} = ?1", column),
                [value],
            )?;
            tx.commit()?;

            if !ids.is_empty() {
                debug!(column, value, deleted = ids.len(), "Deleted index entries");
            }
            Ok(ids.len())
        })
    }

    /// Every workspace that has at least one entry
    pub fn list_distinct_workspaces(&self) -> Result<BTreeSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT workspace FROM memory_entries")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<std::result::Result<_, _>>()?)
        })
    }

    /// Number of entries, optionally for a single file
    pub fn count_entries(&self, file_path: Option<&Path>) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = match file_path {
                Some(path) => conn.query_row(
                    "SELECT COUNT(*) FROM memory_entries WHERE file_path = ?1",
                    [path_key(path)],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))?,
            };
            Ok(count as usize)
        })
    }

    pub fn get_fingerprint(&self, file_path: &Path) -> Result<Option<FileFingerprint>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT file_path, content_hash, record_count, last_indexed_at
                     FROM file_fingerprints WHERE file_path = ?1",
                    [path_key(file_path)],
                    |row| {
                        let file_path: String = row.get(0)?;
                        let content_hash: String = row.get(1)?;
                        let record_count: i64 = row.get(2)?;
                        let last_indexed_at: String = row.get(3)?;
                        Ok((file_path, content_hash, record_count, last_indexed_at))
                    },
                )
                .optional()?;

            Ok(row.map(|(file_path, content_hash, record_count, last_indexed_at)| {
                let last_indexed_at = DateTime::parse_from_rfc3339(&last_indexed_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_default();
                FileFingerprint {
                    file_path,
                    content_hash,
                    record_count: record_count as usize,
                    last_indexed_at,
                }
            }))
        })
    }

    /// Record what a file looked like when it was last fully indexed
    pub fn set_fingerprint(&self, file_path: &Path, content_hash: &str, record_count: usize) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file_fingerprints (file_path, content_hash, record_count, last_indexed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(file_path) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    record_count = excluded.record_count,
                    last_indexed_at = excluded.last_indexed_at",
                params![
                    path_key(file_path),
                    content_hash,
                    record_count as i64,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Drop all entries and fingerprints; the next sweep rebuilds everything
    pub fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM memory_vectors", [])?;
            tx.execute("DELETE FROM memory_entries", [])?;
            tx.execute("DELETE FROM file_fingerprints", [])?;
            tx.commit()?;
            info!("Index cleared");
            Ok(())
        })
    }
}

fn apply_schema(conn: &Connection, dimension: usize) -> Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS memory_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workspace TEXT NOT NULL,
            file_path TEXT NOT NULL,
            line_number INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_entries_file ON memory_entries(file_path);
         CREATE INDEX IF NOT EXISTS idx_entries_workspace ON memory_entries(workspace);
         CREATE TABLE IF NOT EXISTS file_fingerprints (
            file_path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            record_count INTEGER NOT NULL,
            last_indexed_at TEXT NOT NULL
         );
         CREATE VIRTUAL TABLE IF NOT EXISTS memory_vectors USING vec0(
            embedding float[{dimension}]
         );"
    ))?;
    Ok(())
}

fn check_dimension(conn: &Connection, dimension: usize) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO index_meta (key, value) VALUES ('dimension', ?1)",
        [dimension.to_string()],
    )?;
    let stored: String = conn.query_row(
        "SELECT value FROM index_meta WHERE key = 'dimension'",
        [],
        |row| row.get(0),
    )?;

    match stored.parse::<usize>() {
        Ok(stored) if stored == dimension => Ok(()),
        Ok(stored) => Err(RecallError::DimensionMismatch {
            expected: dimension,
            actual: stored,
        }),
        Err(_) => Err(RecallError::Config(format!(
            "Index metadata has invalid dimension '{}'",
            stored
        ))),
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Little-endian f32 bytes, the format vec0 expects
fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> IndexStore {
        let store = IndexStore::in_memory(3);
        store.initialize().unwrap();
        store
    }

    fn log(day: u32) -> PathBuf {
        PathBuf::from(format!("/r/memories/2025-01-0{}/memories.log", day))
    }

    #[test]
    fn test_operations_fail_before_initialize() {
        let store = IndexStore::in_memory(3);
        assert!(!store.is_initialized());
        assert!(matches!(
            store.insert(&[0.0, 0.0, 1.0], "/a", &log(1), 0),
            Err(RecallError::NotInitialized)
        ));
        assert!(matches!(
            store.search(&[0.0, 0.0, 1.0], 1, None),
            Err(RecallError::NotInitialized)
        ));
        assert!(matches!(
            store.get_fingerprint(&log(1)),
            Err(RecallError::NotInitialized)
        ));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = store();
        store.insert(&[1.0, 0.0, 0.0], "/a", &log(1), 0).unwrap();
        store.initialize().unwrap();
        assert_eq!(store.count_entries(None).unwrap(), 1);
    }

    #[test]
    fn test_insert_rejects_wrong_dimension() {
        let store = store();
        let err = store.insert(&[1.0, 0.0], "/a", &log(1), 0).unwrap_err();
        assert!(matches!(
            err,
            RecallError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(store.count_entries(None).unwrap(), 0);
    }

    #[test]
    fn test_search_orders_by_distance() {
        let store = store();
        store.insert(&[0.0, 1.0, 0.0], "/a", &log(1), 0).unwrap();
        store.insert(&[1.0, 0.0, 0.0], "/a", &log(1), 1).unwrap();
        store.insert(&[0.7, 0.7, 0.0], "/a", &log(1), 2).unwrap();

        let hits = store.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].line_number, 1);
        assert_eq!(hits[1].line_number, 2);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn test_workspace_filter_excludes_closer_entries() {
        let store = store();
        for line in 0..4 {
            store.insert(&[1.0, 0.0, 0.0], "/b", &log(1), line).unwrap();
        }
        store.insert(&[0.0, 1.0, 0.0], "/a", &log(2), 0).unwrap();
        store.insert(&[0.0, 0.0, 1.0], "/a", &log(2), 1).unwrap();

        let hits = store.search(&[1.0, 0.0, 0.0], 3, Some("/a")).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.workspace == "/a"));
    }

    #[test]
    fn test_sparse_workspace_may_under_return() {
        let store = IndexStore::in_memory(3).with_overfetch_factor(1);
        store.initialize().unwrap();
        for line in 0..5 {
            store.insert(&[1.0, 0.0, 0.0], "/b", &log(1), line).unwrap();
        }
        store.insert(&[0.0, 0.0, 1.0], "/a", &log(2), 0).unwrap();

        // only 2 candidates fetched, both from /b
        let hits = store.search(&[1.0, 0.0, 0.0], 2, Some("/a")).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_delete_by_file_and_workspace() {
        let store = store();
        store.insert(&[1.0, 0.0, 0.0], "/a", &log(1), 0).unwrap();
        store.insert(&[1.0, 0.0, 0.0], "/a", &log(1), 1).unwrap();
        store.insert(&[0.0, 1.0, 0.0], "/b", &log(2), 0).unwrap();

        assert_eq!(store.delete_by_file(&log(1)).unwrap(), 2);
        assert_eq!(store.delete_by_file(&log(1)).unwrap(), 0);
        assert_eq!(store.count_entries(None).unwrap(), 1);

        store.insert(&[0.0, 0.0, 1.0], "/b", &log(2), 1).unwrap();
        assert_eq!(store.delete_by_address(&log(2), 1).unwrap(), 1);
        assert_eq!(store.delete_by_address(&log(2), 1).unwrap(), 0);

        assert_eq!(store.delete_by_workspace("/b").unwrap(), 1);
        assert_eq!(store.delete_by_workspace("/b").unwrap(), 0);
        assert!(store.search(&[0.0, 1.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_list_distinct_workspaces() {
        let store = store();
        store.insert(&[1.0, 0.0, 0.0], "/a", &log(1), 0).unwrap();
        store.insert(&[1.0, 0.0, 0.0], "/a", &log(1), 1).unwrap();
        store.insert(&[1.0, 0.0, 0.0], "/b", &log(1), 2).unwrap();

        let workspaces: Vec<_> = store.list_distinct_workspaces().unwrap().into_iter().collect();
        assert_eq!(workspaces, vec!["/a".to_string(), "/b".to_string()]);
    }

    #[test]
    fn test_fingerprint_upsert() {
        let store = store();
        assert!(store.get_fingerprint(&log(1)).unwrap().is_none());

        store.set_fingerprint(&log(1), "abc", 2).unwrap();
        store.set_fingerprint(&log(1), "def", 3).unwrap();

        let fp = store.get_fingerprint(&log(1)).unwrap().unwrap();
        assert_eq!(fp.content_hash, "def");
        assert_eq!(fp.record_count, 3);
    }

    #[test]
    fn test_reopen_with_other_dimension_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.db");

        let first = IndexStore::open(&path, 3);
        first.initialize().unwrap();
        first.insert(&[1.0, 0.0, 0.0], "/a", &log(1), 0).unwrap();
        drop(first);

        let reopened = IndexStore::open(&path, 3);
        reopened.initialize().unwrap();
        assert_eq!(reopened.count_entries(None).unwrap(), 1);
        drop(reopened);

        let wrong = IndexStore::open(&path, 4);
        assert!(matches!(
            wrong.initialize(),
            Err(RecallError::DimensionMismatch { .. })
        ));
        assert!(!wrong.is_initialized());
    }

    #[test]
    fn test_clear_removes_everything() {
        let store = store();
        store.insert(&[1.0, 0.0, 0.0], "/a", &log(1), 0).unwrap();
        store.set_fingerprint(&log(1), "abc", 1).unwrap();

        store.clear().unwrap();
        assert_eq!(store.count_entries(None).unwrap(), 0);
        assert!(store.get_fingerprint(&log(1)).unwrap().is_none());
    }
}
