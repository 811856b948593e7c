use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::normalize::{hash_index, hash_tasks_for_path};
use crate::schema::{AiIndexMeta, NormalizedTask, SCHEMA_VERSION};
use crate::writer::encode_rows;

/// New state for one source path.
#[derive(Debug, Clone)]
pub enum PathUpdate {
    Tasks(Vec<NormalizedTask>),
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RowErrors {
    skipped: usize,
    first_error: String,
}

/// In-memory index keyed by source path.
///
/// Per-path hashes are recomputed from the rows on every update and the
/// serialized lines are cached so unchanged paths are never re-encoded.
#[derive(Debug, Default)]
pub struct IndexStore {
    index_by_path: BTreeMap<String, Vec<NormalizedTask>>,
    path_hashes: BTreeMap<String, String>,
    serialized_by_path: BTreeMap<String, Vec<String>>,
    row_errors: BTreeMap<String, RowErrors>,
}

/// Everything a write needs, taken from the store at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    /// Body lines, paths in lexicographic order.
    pub lines: Vec<String>,
    pub task_count: usize,
    pub file_count: usize,
    pub path_hashes: BTreeMap<String, String>,
    pub index_hash: String,
    pub skipped_rows: usize,
    pub first_row_error: Option<String>,
}

impl IndexSnapshot {
    pub fn meta(&self, plugin_version: &str, generated_at: DateTime<Utc>) -> AiIndexMeta {
        AiIndexMeta {
            version: SCHEMA_VERSION,
            plugin_version: plugin_version.to_string(),
            generated_at,
            task_count: self.task_count,
            file_count: self.file_count,
            index_hash: self.index_hash.clone(),
            path_hashes: self.path_hashes.clone(),
            last_error: self.first_row_error.clone(),
        }
    }
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index.  Paths with no rows are dropped.
    pub fn apply_full_rebuild(&mut self, by_path: BTreeMap<String, Vec<NormalizedTask>>) {
        self.clear();
        for (path, tasks) in by_path {
            if !tasks.is_empty() {
                let hash = hash_tasks_for_path(&tasks);
                self.insert_path(path, tasks, hash);
            }
        }
        debug!(
            files = self.index_by_path.len(),
            tasks = self.task_count(),
            "index rebuilt"
        );
    }

    /// Apply one path's new state; `false` when nothing changed.
    pub fn apply_incremental(&mut self, path: &str, update: PathUpdate) -> bool {
        let tasks = match update {
            PathUpdate::Tasks(tasks) if !tasks.is_empty() => tasks,
            PathUpdate::Tasks(_) | PathUpdate::Deleted => return self.remove_path(path),
        };

        let hash = hash_tasks_for_path(&tasks);
        if self.path_hashes.get(path) == Some(&hash) {
            return false;
        }
        self.insert_path(path.to_string(), tasks, hash);
        true
    }

    /// Drop `path` from every map; `false` when it was not indexed.
    pub fn remove_path(&mut self, path: &str) -> bool {
        let existed = self.index_by_path.remove(path).is_some();
        self.path_hashes.remove(path);
        self.serialized_by_path.remove(path);
        self.row_errors.remove(path);
        existed
    }

    fn insert_path(&mut self, path: String, tasks: Vec<NormalizedTask>, hash: String) {
        let encoded = encode_rows(&tasks);
        match encoded.first_error {
            Some(first_error) => {
                self.row_errors.insert(
                    path.clone(),
                    RowErrors {
                        skipped: encoded.skipped,
                        first_error,
                    },
                );
            }
            None => {
                self.row_errors.remove(&path);
            }
        }
        self.serialized_by_path.insert(path.clone(), encoded.lines);
        self.path_hashes.insert(path.clone(), hash);
        self.index_by_path.insert(path, tasks);
    }

    pub fn clear(&mut self) {
        self.index_by_path.clear();
        self.path_hashes.clear();
        self.serialized_by_path.clear();
        self.row_errors.clear();
    }

    #[cfg(test)]
    fn tasks(&self, path: &str) -> Option<&[NormalizedTask]> {
        self.index_by_path.get(path).map(Vec::as_slice)
    }

    #[cfg(test)]
    fn path_hash(&self, path: &str) -> Option<&str> {
        self.path_hashes.get(path).map(String::as_str)
    }

    #[cfg(test)]
    fn serialized(&self, path: &str) -> Option<&[String]> {
        self.serialized_by_path.get(path).map(Vec::as_slice)
    }

    #[cfg(test)]
    fn paths(&self) -> impl Iterator<Item = &str> {
        self.index_by_path.keys().map(String::as_str)
    }

    pub fn file_count(&self) -> usize {
        self.index_by_path.len()
    }

    pub fn task_count(&self) -> usize {
        self.index_by_path.values().map(Vec::len).sum()
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        let lines = self
            .serialized_by_path
            .values()
            .flat_map(|lines| lines.iter().cloned())
            .collect();
        let skipped_rows = self.row_errors.values().map(|errors| errors.skipped).sum();
        let first_row_error = self
            .row_errors
            .values()
            .next()
            .map(|errors| errors.first_error.clone());

        IndexSnapshot {
            lines,
            task_count: self.task_count(),
            file_count: self.file_count(),
            path_hashes: self.path_hashes.clone(),
            index_hash: hash_index(&self.path_hashes),
            skipped_rows,
            first_row_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use taskindex_config::IndexConfig;

    use super::*;
    use crate::normalize::{NormalizeOptions, normalize_tasks};
    use crate::schema::Task;

    fn rows(path: &str, contents: &[&str]) -> Vec<NormalizedTask> {
        let tasks = contents
            .iter()
            .enumerate()
            .map(|(line, content)| Task {
                parser: "inline".to_string(),
                file_path: path.to_string(),
                line: Some(line),
                content: content.to_string(),
                ..Task::default()
            })
            .collect::<Vec<_>>();
        let options = NormalizeOptions::from_config(&IndexConfig::default(), Utc::now());
        normalize_tasks(&tasks, &options)
            .remove(path)
            .unwrap_or_default()
    }

    #[test]
    fn incremental_update_is_idempotent() {
        let mut store = IndexStore::new();
        assert!(store.apply_incremental("a.md", PathUpdate::Tasks(rows("a.md", &["one"]))));
        assert!(!store.apply_incremental("a.md", PathUpdate::Tasks(rows("a.md", &["one"]))));
        assert!(store.apply_incremental("a.md", PathUpdate::Tasks(rows("a.md", &["two"]))));
        assert_eq!(store.tasks("a.md").unwrap()[0].content, "two");
    }

    #[test]
    fn empty_update_removes_path_from_all_maps() {
        let mut store = IndexStore::new();
        store.apply_incremental("a.md", PathUpdate::Tasks(rows("a.md", &["one"])));
        assert!(store.path_hash("a.md").is_some());
        assert!(store.serialized("a.md").is_some());

        assert!(store.apply_incremental("a.md", PathUpdate::Tasks(Vec::new())));
        assert!(store.tasks("a.md").is_none());
        assert!(store.path_hash("a.md").is_none());
        assert!(store.serialized("a.md").is_none());
        assert!(!store.apply_incremental("a.md", PathUpdate::Deleted));
    }

    #[test]
    fn path_hash_matches_rows() {
        let mut store = IndexStore::new();
        let a = rows("a.md", &["one", "two"]);
        store.apply_incremental("a.md", PathUpdate::Tasks(a.clone()));
        assert_eq!(store.path_hash("a.md"), Some(hash_tasks_for_path(&a).as_str()));
    }

    #[test]
    fn full_rebuild_replaces_everything() {
        let mut store = IndexStore::new();
        store.apply_incremental("old.md", PathUpdate::Tasks(rows("old.md", &["x"])));

        let mut by_path = BTreeMap::new();
        by_path.insert("b.md".to_string(), rows("b.md", &["b1"]));
        by_path.insert("a.md".to_string(), rows("a.md", &["a1", "a2"]));
        by_path.insert("empty.md".to_string(), Vec::new());
        store.apply_full_rebuild(by_path);

        assert_eq!(store.paths().collect::<Vec<_>>(), vec!["a.md", "b.md"]);
        assert_eq!(store.task_count(), 3);
        assert!(store.tasks("old.md").is_none());
    }

    #[test]
    fn snapshot_orders_lines_by_path_and_hashes_index() {
        let mut store = IndexStore::new();
        store.apply_incremental("z.md", PathUpdate::Tasks(rows("z.md", &["last"])));
        store.apply_incremental("a.md", PathUpdate::Tasks(rows("a.md", &["first", "second"])));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.lines.len(), 3);
        assert!(snapshot.lines[0].contains("\"first\""));
        assert!(snapshot.lines[2].contains("\"last\""));
        assert_eq!(snapshot.file_count, 2);
        assert_eq!(snapshot.task_count, 3);
        assert_eq!(snapshot.index_hash, hash_index(&snapshot.path_hashes));

        let meta = snapshot.meta("0.1.0", Utc::now());
        assert_eq!(meta.version, SCHEMA_VERSION);
        assert_eq!(meta.task_count, 3);
        assert!(meta.last_error.is_none());
    }

    #[test]
    fn empty_store_snapshot() {
        let snapshot = IndexStore::new().snapshot();
        assert!(snapshot.lines.is_empty());
        assert_eq!(snapshot.task_count, 0);
        assert!(snapshot.path_hashes.is_empty());
    }
}
