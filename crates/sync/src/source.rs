//! Seams to the host: where tasks come from and where failure notices go.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::error;

use crate::schema::Task;

/// Read side of the host's live task collection.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Snapshot of every task currently known to the host.
    async fn tasks(&self) -> Vec<Task>;

    /// Current tasks for one source path.  Hosts with a per-file cache should
    /// override this instead of filtering the full snapshot.
    async fn tasks_for_path(&self, path: &str) -> Vec<Task> {
        self.tasks()
            .await
            .into_iter()
            .filter(|task| task.file_path == path)
            .collect()
    }
}

/// User-facing failure notices.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Default notifier: notices become `error` log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        error!(notice = %message, "task index notice");
    }
}

/// A [`TaskSource`] over a vector the host replaces wholesale.
#[derive(Debug, Default)]
pub struct MemoryTaskSource {
    tasks: RwLock<Vec<Task>>,
}

impl MemoryTaskSource {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks),
        }
    }

    pub fn set_tasks(&self, tasks: Vec<Task>) {
        *self.tasks.write().unwrap_or_else(PoisonError::into_inner) = tasks;
    }

    /// Replace every task of `path` with `tasks`.
    pub fn replace_path(&self, path: &str, tasks: Vec<Task>) {
        let mut guard = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|task| task.file_path != path);
        guard.extend(tasks);
    }
}

#[async_trait]
impl TaskSource for MemoryTaskSource {
    async fn tasks(&self) -> Vec<Task> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
