use tracing::info;

use casegen_core::TaskId;
use casegen_tasks::{TaskManager, TaskStore};

use crate::error::AiError;
use crate::job::AiJob;

/// Turns AI jobs into tracked background tasks.
///
/// `submit` records the task (seeded with the job's context) and schedules
/// it, returning the task id without waiting for the job.
pub struct AiScheduler<S> {
    manager: TaskManager<S>,
}

impl<S> Clone for AiScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<S: TaskStore + 'static> AiScheduler<S> {
    pub fn new(manager: TaskManager<S>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &TaskManager<S> {
        &self.manager
    }

    pub async fn submit<J: AiJob>(&self, job: J) -> Result<TaskId, AiError> {
        let task_type = job.task_type();
        let task_id = self.manager.create_task(task_type, job.context()).await?;

        if !self
            .manager
            .run_background_task(task_id, move |task| job.run(task))
        {
            return Err(AiError::NotScheduled(task_id));
        }

        info!(task_id = %task_id, task_type, "ai job submitted");
        Ok(task_id)
    }
}
