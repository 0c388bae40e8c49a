use std::future::Future;

use serde_json::{Map, Value};

use casegen_tasks::{TaskHandle, TaskStore};

/// A long-running AI unit of work tracked as a task.
///
/// Jobs run on the background worker. They report progress and partial
/// results through their [`TaskHandle`]; the value they return becomes the
/// task's output, an error becomes the task's failure message.
pub trait AiJob: Send + 'static {
    /// Task type recorded on the task (e.g. `generate_cases`).
    fn task_type(&self) -> &'static str;

    /// Context seeded into the task's result at creation; protected afterwards.
    fn context(&self) -> Map<String, Value>;

    /// Execute the job.
    fn run<S: TaskStore + 'static>(
        self,
        task: TaskHandle<S>,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send;
}
