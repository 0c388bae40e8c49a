//! Task storage: the store abstraction and an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use casegen_core::TaskId;

use super::types::{Task, TaskStatus};

/// Largest page a single `list` call may return.
pub const MAX_PAGE_SIZE: u32 = 100;
/// Page size used when the caller does not pick one.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Task table abstraction.
///
/// The engine only ever reads whole records and writes whole records; merging
/// happens in the manager under a per-task lock.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a task record.
    async fn put(&self, task: Task) -> Result<(), TaskStoreError>;

    /// Get a task by ID.
    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// List tasks matching `filter`, ordered by `updated_at` descending.
    async fn list(&self, filter: &TaskFilter, page: Page) -> Result<TaskPage, TaskStoreError>;

    /// Remove a task. Returns whether a record existed.
    async fn delete(&self, task_id: TaskId) -> Result<bool, TaskStoreError>;
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Filter criteria for task listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Only tasks of this type (e.g. "generate_cases").
    pub task_type: Option<String>,
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.task_type.as_deref().is_none_or(|t| task.task_type == t)
            && self.status.is_none_or(|s| task.status == s)
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    /// Page numbers below 1 become 1; sizes are clamped to `1..=MAX_PAGE_SIZE`.
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Number of records to skip.
    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.page_size as usize
    }
}

/// One page of tasks plus the total number of matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPage {
    pub items: Vec<Task>,
    /// Matches across all pages
    pub total: u64,
}

/// In-memory task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|tasks| tasks.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> TaskStoreError {
    TaskStoreError::Storage("task table lock poisoned".to_string())
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put(&self, task: Task) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        tasks.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(&task_id).cloned())
    }

    async fn list(&self, filter: &TaskFilter, page: Page) -> Result<TaskPage, TaskStoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let mut matching: Vec<&Task> = tasks.values().filter(|t| filter.matches(t)).collect();

        // Newest first; ties broken by id so pages are stable.
        matching.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .cloned()
            .collect();

        Ok(TaskPage { items, total })
    }

    async fn delete(&self, task_id: TaskId) -> Result<bool, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        Ok(tasks.remove(&task_id).is_some())
    }
}

#[async_trait::async_trait]
impl<T: TaskStore + ?Sized> TaskStore for Arc<T> {
    async fn put(&self, task: Task) -> Result<(), TaskStoreError> {
        (**self).put(task).await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get(task_id).await
    }

    async fn list(&self, filter: &TaskFilter, page: Page) -> Result<TaskPage, TaskStoreError> {
        (**self).list(filter, page).await
    }

    async fn delete(&self, task_id: TaskId) -> Result<bool, TaskStoreError> {
        (**self).delete(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::Map;

    fn task(task_type: &str, status: TaskStatus, age_secs: i64) -> Task {
        let mut task = Task::new(task_type, Map::new());
        task.status = status;
        task.updated_at = Utc::now() - Duration::seconds(age_secs);
        task
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = InMemoryTaskStore::new();
        let t = task("generate_cases", TaskStatus::Pending, 0);
        let id = t.id;

        store.put(t.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(t));

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let store = InMemoryTaskStore::new();
        let old = task("generate_cases", TaskStatus::Completed, 30);
        let new = task("generate_cases", TaskStatus::Completed, 1);
        let other_type = task("export_xmind", TaskStatus::Completed, 0);
        let other_status = task("generate_cases", TaskStatus::Failed, 0);
        for t in [&old, &new, &other_type, &other_status] {
            store.put(t.clone()).await.unwrap();
        }

        let filter = TaskFilter::new()
            .with_type("generate_cases")
            .with_status(TaskStatus::Completed);
        let page = store.list(&filter, Page::default()).await.unwrap();

        assert_eq!(page.total, 2);
        let ids: Vec<_> = page.items.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![new.id, old.id]);
    }

    #[tokio::test]
    async fn list_paginates() {
        let store = InMemoryTaskStore::new();
        for age in 0..5 {
            store
                .put(task("generate_cases", TaskStatus::Pending, age))
                .await
                .unwrap();
        }

        let second = store.list(&TaskFilter::new(), Page::new(2, 2)).await.unwrap();
        let last = store.list(&TaskFilter::new(), Page::new(3, 2)).await.unwrap();
        let beyond = store.list(&TaskFilter::new(), Page::new(9, 2)).await.unwrap();

        assert_eq!(second.total, 5);
        assert_eq!(second.items.len(), 2);
        assert_eq!(last.items.len(), 1);
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 5);
    }

    #[test]
    fn page_bounds() {
        assert_eq!(Page::new(0, 0), Page { page: 1, page_size: 1 });
        assert_eq!(Page::new(2, 1000).page_size, MAX_PAGE_SIZE);
        assert_eq!(Page::new(3, 10).offset(), 20);
    }
}
