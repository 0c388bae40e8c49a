//! Task lifecycle management.
//!
//! The manager owns the task table (through a [`TaskStore`]) and is the only
//! writer to it. Every mutation goes through [`TaskManager::update_task`],
//! which serializes read-merge-write cycles per task id. Background jobs are
//! driven through `pending -> running -> completed | failed` on the shared
//! [`BackgroundExecutor`]; errors and panics raised by a job are recorded on
//! the task and never reach the code that scheduled it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use casegen_core::TaskId;

use super::executor::BackgroundExecutor;
use super::store::{
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, Page, TaskFilter, TaskPage, TaskStore, TaskStoreError,
};
use super::types::{ResultUpdate, Task, TaskStatus, TaskUpdate, UpdateRejection};

/// Collaborator that removes artifacts derived from a task (generated cases,
/// exported diagrams, ...) when the task is deleted with `cascade = true`.
#[async_trait::async_trait]
pub trait DerivedArtifacts: Send + Sync {
    async fn delete_for_task(&self, task_id: TaskId) -> anyhow::Result<()>;
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskStats {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }
}

/// Owns task records and drives background jobs through their lifecycle.
pub struct TaskManager<S> {
    store: Arc<S>,
    executor: Arc<BackgroundExecutor>,
    locks: Arc<TaskLocks>,
    derived: Option<Arc<dyn DerivedArtifacts>>,
    default_page_size: u32,
}

impl<S> Clone for TaskManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            executor: self.executor.clone(),
            locks: self.locks.clone(),
            derived: self.derived.clone(),
            default_page_size: self.default_page_size,
        }
    }
}

impl<S> std::fmt::Debug for TaskManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("executor", &self.executor.name())
            .field("cascade", &self.derived.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of one applied update.
#[derive(Debug)]
struct Applied {
    previous: TaskStatus,
    status: TaskStatus,
}

impl<S: TaskStore + 'static> TaskManager<S> {
    pub fn new(store: S, executor: Arc<BackgroundExecutor>) -> Self {
        Self {
            store: Arc::new(store),
            executor,
            locks: Arc::new(TaskLocks::default()),
            derived: None,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Page size used by [`page`](Self::page) when the caller gives none.
    pub fn with_default_page_size(mut self, page_size: u32) -> Self {
        self.default_page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Register the collaborator consulted by cascading deletes.
    pub fn with_derived_artifacts(mut self, derived: Arc<dyn DerivedArtifacts>) -> Self {
        self.derived = Some(derived);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn executor(&self) -> &Arc<BackgroundExecutor> {
        &self.executor
    }

    /// Persist a new pending task whose `result` is seeded from `params`.
    ///
    /// Returns as soon as the record is stored; nothing is scheduled.
    pub async fn create_task(
        &self,
        task_type: impl Into<String>,
        params: Map<String, Value>,
    ) -> Result<TaskId, TaskStoreError> {
        let task = Task::new(task_type, params);
        let task_id = task.id;
        let task_type = task.task_type.clone();

        self.store.put(task).await?;
        info!(task_id = %task_id, task_type = %task_type, "task created");
        Ok(task_id)
    }

    pub async fn get_task_info(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        self.store.get(task_id).await
    }

    /// Apply a partial update to a task.
    ///
    /// Unknown ids are a logged no-op. Refused parts of the update (status
    /// regression, progress going backwards, protected context keys) are
    /// logged and the rest is still applied. Returns whether a record was
    /// written.
    pub async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> bool {
        self.apply_update(task_id, update).await.is_some()
    }

    async fn apply_update(&self, task_id: TaskId, update: TaskUpdate) -> Option<Applied> {
        let _guard = self.locks.acquire(task_id).await;

        let mut task = match self.store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %task_id, "update for unknown task ignored");
                return None;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to load task for update");
                return None;
            }
        };

        let previous = task.status;
        let rejections = task.apply(update);
        log_rejections(task_id, &rejections);
        let status = task.status;
        let progress = task.progress;

        if let Err(e) = self.store.put(task).await {
            error!(task_id = %task_id, error = %e, "failed to persist task update");
            return None;
        }

        debug!(task_id = %task_id, status = %status, progress, "task updated");
        Some(Applied { previous, status })
    }

    /// Run `job` on the background worker and record its outcome on the task.
    ///
    /// Returns immediately. On the worker the task moves to `running`, then to
    /// `completed` with the job's output merged into `result`, or to `failed`
    /// with the error chain in `error`. Only a `pending` task is started, so
    /// scheduling the same task twice runs the job once.
    ///
    /// Returns `false` (and logs) if the worker could not accept the job; the
    /// task then stays `pending`.
    pub fn run_background_task<F, Fut>(&self, task_id: TaskId, job: F) -> bool
    where
        F: FnOnce(TaskHandle<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let manager = self.clone();
        match self.executor.submit(manager.drive(task_id, job)) {
            Ok(()) => {
                debug!(task_id = %task_id, executor = %self.executor.name(), "background task scheduled");
                true
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to schedule background task");
                false
            }
        }
    }

    async fn drive<F, Fut>(self, task_id: TaskId, job: F)
    where
        F: FnOnce(TaskHandle<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        match self.apply_update(task_id, TaskUpdate::running()).await {
            Some(Applied {
                previous: TaskStatus::Pending,
                status: TaskStatus::Running,
            }) => {}
            Some(applied) => {
                warn!(task_id = %task_id, status = %applied.previous, "task is not pending; job not started");
                return;
            }
            None => {
                warn!(task_id = %task_id, "task could not be moved to running; job not started");
                return;
            }
        }

        info!(task_id = %task_id, "background task started");
        let handle = TaskHandle {
            manager: self.clone(),
            task_id,
        };

        // Both the closure call and its future run inside the spawned task, so
        // a panic in either surfaces as a JoinError here.
        let update = match tokio::spawn(async move { job(handle).await }).await {
            Ok(Ok(output)) => {
                info!(task_id = %task_id, "background task completed");
                TaskUpdate::completed(output)
            }
            Ok(Err(err)) => {
                let mut message = format!("{err:#}");
                if message.is_empty() {
                    message = "background job failed".to_string();
                }
                error!(task_id = %task_id, error = %message, "background task failed");
                TaskUpdate::failed(message)
            }
            Err(join_err) if join_err.is_panic() => {
                error!(task_id = %task_id, "background task panicked");
                TaskUpdate::failed("background job panicked")
            }
            Err(join_err) => {
                error!(task_id = %task_id, error = %join_err, "background task aborted");
                TaskUpdate::failed(format!("background job aborted: {join_err}"))
            }
        };

        if !self.update_task(task_id, update).await {
            error!(task_id = %task_id, "final task state could not be recorded");
        }
    }

    /// Page request from optional query parameters; a missing page is 1 and
    /// a missing size is this manager's default.
    pub fn page(&self, page: Option<u32>, page_size: Option<u32>) -> Page {
        Page::new(page.unwrap_or(1), page_size.unwrap_or(self.default_page_size))
    }

    /// List tasks, newest `updated_at` first.
    pub async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: Page,
    ) -> Result<TaskPage, TaskStoreError> {
        self.store.list(filter, page).await
    }

    /// Remove a task record. Returns whether a record existed.
    ///
    /// With `cascade`, the registered [`DerivedArtifacts`] collaborator is
    /// asked to remove what the task produced; its failure is logged only.
    pub async fn delete_task(&self, task_id: TaskId, cascade: bool) -> bool {
        let removed = {
            let _guard = self.locks.acquire(task_id).await;
            self.store.delete(task_id).await
        };

        match removed {
            Ok(true) => {
                info!(task_id = %task_id, cascade, "task deleted");
                if cascade {
                    self.delete_derived(task_id).await;
                }
                true
            }
            Ok(false) => {
                debug!(task_id = %task_id, "delete for unknown task");
                false
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to delete task");
                false
            }
        }
    }

    async fn delete_derived(&self, task_id: TaskId) {
        let Some(derived) = &self.derived else {
            debug!(task_id = %task_id, "no derived-artifact collaborator; cascade skipped");
            return;
        };
        if let Err(e) = derived.delete_for_task(task_id).await {
            let message = format!("{e:#}");
            warn!(task_id = %task_id, error = %message, "failed to delete derived artifacts");
        }
    }

    /// Count tasks per status.
    pub async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let mut stats = TaskStats::default();
        for status in TaskStatus::ALL {
            let filter = TaskFilter::new().with_status(status);
            let total = self.store.list(&filter, Page::new(1, 1)).await?.total;
            match status {
                TaskStatus::Pending => stats.pending = total,
                TaskStatus::Running => stats.running = total,
                TaskStatus::Completed => stats.completed = total,
                TaskStatus::Failed => stats.failed = total,
            }
        }
        Ok(stats)
    }
}

fn log_rejections(task_id: TaskId, rejections: &[UpdateRejection]) {
    for rejection in rejections {
        warn!(task_id = %task_id, reason = %rejection, "task update partially ignored");
    }
}

/// What a running job sees of its own task.
///
/// Jobs can report progress and partial results; status changes are reserved
/// to the lifecycle boundary.
pub struct TaskHandle<S> {
    manager: TaskManager<S>,
    task_id: TaskId,
}

impl<S> Clone for TaskHandle<S> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            task_id: self.task_id,
        }
    }
}

impl<S: TaskStore + 'static> TaskHandle<S> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn report_progress(&self, progress: u8) -> bool {
        self.manager
            .update_task(self.task_id, TaskUpdate::progress(progress))
            .await
    }

    pub async fn record(&self, result: ResultUpdate) -> bool {
        self.manager
            .update_task(self.task_id, TaskUpdate::result(result))
            .await
    }

    /// Progress and a partial result in one atomic update.
    pub async fn report(&self, progress: u8, result: ResultUpdate) -> bool {
        self.manager
            .update_task(
                self.task_id,
                TaskUpdate::progress(progress).with_result(result),
            )
            .await
    }

    /// Current state of the task, if it still exists.
    pub async fn snapshot(&self) -> Option<Task> {
        match self.manager.get_task_info(self.task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "failed to read task");
                None
            }
        }
    }
}

/// Per-task async locks; an entry lives only while someone holds or awaits it.
#[derive(Debug, Default)]
struct TaskLocks {
    inner: Mutex<HashMap<TaskId, Arc<AsyncMutex<()>>>>,
}

impl TaskLocks {
    async fn acquire(&self, task_id: TaskId) -> TaskLockGuard<'_> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(task_id).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;

        TaskLockGuard {
            locks: self,
            task_id,
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct TaskLockGuard<'a> {
    locks: &'a TaskLocks,
    task_id: TaskId,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self
            .locks
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Table + this guard: nobody else holds or waits on this lock.
        let idle = Arc::strong_count(&self.lock) == 2;
        let same = locks
            .get(&self.task_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.lock));
        if idle && same {
            locks.remove(&self.task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::executor::ExecutorConfig;
    use crate::store::InMemoryTaskStore;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    fn manager(name: &str) -> TaskManager<Arc<InMemoryTaskStore>> {
        TaskManager::new(
            InMemoryTaskStore::arc(),
            BackgroundExecutor::arc(ExecutorConfig::default().with_name(name)),
        )
    }

    async fn wait_terminal<S: TaskStore + 'static>(manager: &TaskManager<S>, id: TaskId) -> Task {
        for _ in 0..500 {
            if let Some(task) = manager.get_task_info(id).await.unwrap() {
                if task.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} did not reach a terminal state");
    }

    /// Store that yields between every operation, inviting interleaving.
    #[derive(Default)]
    struct YieldingStore {
        inner: InMemoryTaskStore,
        failed_writes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TaskStore for YieldingStore {
        async fn put(&self, task: Task) -> Result<(), TaskStoreError> {
            tokio::task::yield_now().await;
            if task.status == TaskStatus::Failed {
                self.failed_writes.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.put(task).await
        }

        async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
            tokio::task::yield_now().await;
            self.inner.get(task_id).await
        }

        async fn list(&self, filter: &TaskFilter, page: Page) -> Result<TaskPage, TaskStoreError> {
            self.inner.list(filter, page).await
        }

        async fn delete(&self, task_id: TaskId) -> Result<bool, TaskStoreError> {
            self.inner.delete(task_id).await
        }
    }

    #[tokio::test]
    async fn created_task_is_pending_with_params() {
        let manager = manager("create-worker");

        let id = manager
            .create_task("generate_cases", params(json!({"project_name": "Acme"})))
            .await
            .unwrap();
        let task = manager.get_task_info(id).await.unwrap().unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.result.as_map(), &params(json!({"project_name": "Acme"})));
        assert!(!manager.executor().is_started());
    }

    #[tokio::test]
    async fn update_of_unknown_task_is_a_no_op() {
        let manager = manager("unknown-worker");

        assert!(!manager.update_task(TaskId::new(), TaskUpdate::progress(10)).await);
        assert!(manager.store().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_disjoint_updates_both_land() {
        let store = Arc::new(YieldingStore::default());
        let manager = TaskManager::new(
            store.clone(),
            BackgroundExecutor::arc(ExecutorConfig::default().with_name("disjoint-worker")),
        );

        for _ in 0..20 {
            let id = manager.create_task("t", Map::new()).await.unwrap();

            let a = manager.clone();
            let b = manager.clone();
            let (ra, rb) = tokio::join!(
                tokio::spawn(async move {
                    a.update_task(id, TaskUpdate::result(ResultUpdate::fields(json!({"a": 1}))))
                        .await
                }),
                tokio::spawn(async move {
                    b.update_task(id, TaskUpdate::result(ResultUpdate::fields(json!({"b": 2}))))
                        .await
                }),
            );
            assert!(ra.unwrap() && rb.unwrap());

            let task = manager.get_task_info(id).await.unwrap().unwrap();
            assert_eq!(task.result.get("a"), Some(&json!(1)));
            assert_eq!(task.result.get("b"), Some(&json!(2)));
        }
        assert_eq!(manager.locks.len(), 0);
    }

    #[tokio::test]
    async fn successful_job_completes_with_output_and_context() {
        let manager = manager("success-worker");
        let id = manager
            .create_task("generate_cases", params(json!({"project_name": "Acme"})))
            .await
            .unwrap();

        let scheduled = manager.run_background_task(id, |handle| async move {
            handle.report_progress(50).await;
            Ok(json!({"cases": 2}))
        });
        assert!(scheduled);

        let task = wait_terminal(&manager, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result.get("cases"), Some(&json!(2)));
        assert_eq!(task.result.get("project_name"), Some(&json!("Acme")));
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn failing_job_is_recorded_once_and_not_propagated() {
        let store = Arc::new(YieldingStore::default());
        let manager = TaskManager::new(
            store.clone(),
            BackgroundExecutor::arc(ExecutorConfig::default().with_name("failure-worker")),
        );
        let id = manager.create_task("generate_cases", Map::new()).await.unwrap();

        let scheduled = manager.run_background_task(id, |_handle| async {
            Err(anyhow::anyhow!("model refused").context("case generation failed"))
        });
        assert!(scheduled);

        let task = wait_terminal(&manager, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_deref(),
            Some("case generation failed: model refused")
        );
        assert_eq!(store.failed_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_job_fails_the_task() {
        let manager = manager("panic-task-worker");
        let id = manager.create_task("t", Map::new()).await.unwrap();

        manager.run_background_task(id, |_handle| async {
            if true {
                panic!("decoder crashed");
            }
            Ok(Value::Null)
        });

        let task = wait_terminal(&manager, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("background job panicked"));
    }

    #[tokio::test]
    async fn job_closure_panicking_before_its_future_fails_the_task() {
        let manager = manager("eager-panic-worker");
        let id = manager.create_task("t", Map::new()).await.unwrap();

        manager.run_background_task(id, |_handle| {
            let pages: Vec<u8> = Vec::new();
            let _ = pages[3];
            async { Ok(Value::Null) }
        });

        let task = wait_terminal(&manager, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("background job panicked"));
        assert_eq!(manager.executor().stats().jobs_panicked, 0);
    }

    #[tokio::test]
    async fn scheduling_twice_runs_the_job_once() {
        let manager = manager("twice-worker");
        let id = manager.create_task("t", Map::new()).await.unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = runs.clone();
            manager.run_background_task(id, move |_handle| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            });
        }

        wait_terminal(&manager, id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completed_task_keeps_status_on_later_updates() {
        let manager = manager("sticky-worker");
        let id = manager.create_task("t", Map::new()).await.unwrap();
        manager.run_background_task(id, |_handle| async { Ok(json!({"done": true})) });
        wait_terminal(&manager, id).await;

        assert!(
            manager
                .update_task(
                    id,
                    TaskUpdate::failed("late failure")
                        .with_result(ResultUpdate::fields(json!({"note": "after"})))
                )
                .await
        );

        let task = manager.get_task_info(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
        assert_eq!(task.result.get("note"), Some(&json!("after")));
    }

    #[tokio::test]
    async fn list_and_stats() {
        let manager = manager("list-worker");
        let first = manager.create_task("generate_cases", Map::new()).await.unwrap();
        let second = manager.create_task("generate_cases", Map::new()).await.unwrap();
        manager.create_task("export_xmind", Map::new()).await.unwrap();
        manager.update_task(first, TaskUpdate::running()).await;

        let page = manager
            .list_tasks(&TaskFilter::new().with_type("generate_cases"), Page::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, first);
        assert_eq!(page.items[1].id, second);

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total(), 3);
    }

    struct RecordingArtifacts {
        deleted: Mutex<Vec<TaskId>>,
    }

    #[async_trait::async_trait]
    impl DerivedArtifacts for RecordingArtifacts {
        async fn delete_for_task(&self, task_id: TaskId) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(task_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delete_with_and_without_cascade() {
        let artifacts = Arc::new(RecordingArtifacts {
            deleted: Mutex::new(Vec::new()),
        });
        let manager = manager("delete-worker").with_derived_artifacts(artifacts.clone());
        let kept_artifacts = manager.create_task("t", Map::new()).await.unwrap();
        let cascaded = manager.create_task("t", Map::new()).await.unwrap();

        assert!(manager.delete_task(kept_artifacts, false).await);
        assert!(manager.delete_task(cascaded, true).await);
        assert!(!manager.delete_task(cascaded, true).await);

        assert!(manager.get_task_info(cascaded).await.unwrap().is_none());
        assert_eq!(*artifacts.deleted.lock().unwrap(), vec![cascaded]);
    }
}
