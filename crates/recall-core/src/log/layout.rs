//! On-disk layout: `<root>/memories/<YYYY-MM-DD>/memories.log`

use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory under the log root holding the per-day folders
pub const MEMORIES_DIR: &str = "memories";

/// File name of every day's log
pub const LOG_FILE_NAME: &str = "memories.log";

/// Conventional name of a log root kept inside a project directory
pub const STORE_DIR_NAME: &str = ".recall";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Absolute form of a log root, without touching the file system.
///
/// Falls back to the path as given if the working directory is unavailable.
pub fn absolute_root(root: impl Into<PathBuf>) -> PathBuf {
    let root = root.into();
    std::path::absolute(&root).unwrap_or(root)
}

/// Log file for a calendar day
pub fn log_path_for(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(MEMORIES_DIR)
        .join(date.format(DATE_FORMAT).to_string())
        .join(LOG_FILE_NAME)
}

/// Whether a path looks like a day log (`memories/<date>/memories.log`)
pub fn is_log_file(path: &Path) -> bool {
    if path.file_name().and_then(|n| n.to_str()) != Some(LOG_FILE_NAME) {
        return false;
    }

    let Some(day_dir) = path.parent() else {
        return false;
    };
    let is_date = day_dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| NaiveDate::parse_from_str(n, DATE_FORMAT).is_ok());

    is_date
        && day_dir
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            == Some(MEMORIES_DIR)
}

/// Workspace for records written before workspace tagging existed.
///
/// A root named `.recall` lives inside the project it belongs to, so the
/// workspace is that project directory; any other root is its own workspace.
pub fn infer_workspace(path: &Path) -> Option<String> {
    let root = path.parent()?.parent()?.parent()?;
    let workspace = match root.file_name().and_then(|n| n.to_str()) {
        Some(STORE_DIR_NAME) => root.parent().unwrap_or(root),
        _ => root,
    };
    Some(workspace.to_string_lossy().to_string())
}

/// Every day log under `root`, sorted (day folders sort chronologically)
pub fn list_log_files(root: &Path) -> Vec<PathBuf> {
    let memories = root.join(MEMORIES_DIR);
    if !memories.is_dir() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = WalkDir::new(&memories)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_log_file(path))
        .collect();
    files.sort();
    files
}
