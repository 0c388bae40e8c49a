//! `casegen-tasks`
//!
//! Async task orchestration: trackable background work with retries and
//! partial-failure-tolerant batches.
//!
//! ## Design
//!
//! - A task is a persisted record (`pending -> running -> completed | failed`)
//!   with integer progress and a structured result
//! - Jobs run on one long-lived background worker, never on the caller's path
//! - Updates to a task are serialized per task id and merged field by field
//! - Flaky external calls go through a bounded, exponential-backoff retry
//! - Batches skip failing items and only fail when nothing succeeded
//!
//! ## Components
//!
//! - `TaskManager`: creates, updates, lists and deletes tasks; drives jobs
//! - `TaskStore`: task table abstraction (`InMemoryTaskStore` for tests/dev)
//! - `BackgroundExecutor`: the single background worker
//! - `ResilientCaller`: retry wrapper for external calls
//! - `BatchPipeline`: sequential batch processing with consolidation
//! - `EngineConfig`: `CASEGEN_*` environment configuration

pub mod config;
pub mod executor;
pub mod manager;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use executor::{BackgroundExecutor, ExecutorConfig, ExecutorError, ExecutorStats};
pub use manager::{DerivedArtifacts, TaskHandle, TaskManager, TaskStats};
pub use pipeline::{BatchPipeline, BatchReport, Consolidated, PipelineError};
pub use retry::{ResilientCaller, RetryPolicy};
pub use store::{InMemoryTaskStore, Page, TaskFilter, TaskPage, TaskStore, TaskStoreError};
pub use types::{
    ItemFailure, ResultUpdate, Task, TaskResult, TaskStatus, TaskUpdate, UnknownStatus,
    UpdateRejection,
};
