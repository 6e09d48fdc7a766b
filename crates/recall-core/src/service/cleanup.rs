//! Pruning of index entries whose workspace directory is gone

use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::index::IndexStore;

/// Delete entries for every workspace that no longer exists on disk.
///
/// Returns the pruned workspaces. Running it again prunes nothing.
pub fn prune_missing_workspaces(index: &IndexStore) -> Result<BTreeSet<String>> {
    let mut pruned = BTreeSet::new();
    for workspace in index.list_distinct_workspaces()? {
        if Path::new(&workspace).exists() {
            continue;
        }
        let removed = index.delete_by_workspace(&workspace)?;
        info!(workspace = %workspace, entries = removed, "Pruned missing workspace");
        pruned.insert(workspace);
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prunes_only_missing_workspaces() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        let (a, b) = (a.to_string_lossy().to_string(), b.to_string_lossy().to_string());

        let index = IndexStore::in_memory(2);
        index.initialize().unwrap();
        let log = Path::new("/logs/memories/2025-01-01/memories.log");
        index.insert(&[1.0, 0.0], &a, log, 0).unwrap();
        index.insert(&[0.0, 1.0], &b, log, 1).unwrap();
        index.insert(&[0.5, 0.5], &b, log, 2).unwrap();

        let pruned = prune_missing_workspaces(&index).unwrap();
        assert_eq!(pruned, BTreeSet::from([b.clone()]));
        assert_eq!(index.list_distinct_workspaces().unwrap(), BTreeSet::from([a]));
        assert_eq!(index.count_entries(None).unwrap(), 1);

        assert!(prune_missing_workspaces(&index).unwrap().is_empty());
    }
}
