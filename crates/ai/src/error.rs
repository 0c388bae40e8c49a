use thiserror::Error;

use casegen_core::TaskId;
use casegen_tasks::TaskStoreError;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("failed to record job task: {0}")]
    Store(#[from] TaskStoreError),

    /// The task exists but stays `pending`; the worker refused the job.
    #[error("task {0} was created but could not be scheduled")]
    NotScheduled(TaskId),
}

/// Why a case generation run produced nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("requirement analysis produced an empty summary")]
    EmptySummary,

    #[error("no test cases were generated")]
    NoCases,
}
