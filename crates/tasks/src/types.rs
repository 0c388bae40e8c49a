//! Task record, status machine and result update rules.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use casegen_core::{ErrorKind, TaskId};

/// Result key written by [`ResultUpdate::Progress`].
pub const STAGE_KEY: &str = "stage";
/// Result key written by [`ResultUpdate::Progress`].
pub const ITEMS_COMPLETED_KEY: &str = "items_completed";
/// Result key written by [`ResultUpdate::Progress`].
pub const ITEMS_TOTAL_KEY: &str = "items_total";
/// Result key holding a non-object job output.
pub const OUTPUT_KEY: &str = "output";
/// Result key collecting per-item failures of a batch.
pub const ITEM_ERRORS_KEY: &str = "item_errors";

/// Task lifecycle status.
///
/// `pending -> running -> completed | failed`. Terminal states have no outgoing edges.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up by the background worker
    Pending,
    /// Job body is executing
    Running,
    /// Job body returned a value
    Completed,
    /// Job body returned an error (or panicked)
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status name that is not one of `pending`, `running`, `completed`, `failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl std::str::FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// One skipped item of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Zero-based position of the item in the batch input
    pub index: usize,
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemFailure {
    fn to_json(&self) -> Value {
        json!({
            "index": self.index,
            "kind": self.kind.as_str(),
            "message": self.message,
        })
    }
}

/// A change to a task's `result`, one variant per known shape.
///
/// Each variant has a fixed merge rule (see [`TaskResult`]); fields that an
/// update does not mention are always preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultUpdate {
    /// Field-level merge of arbitrary top-level keys.
    Fields(Map<String, Value>),
    /// Batch progress: writes `stage`, `items_completed`, `items_total`.
    Progress {
        stage: String,
        completed: usize,
        total: usize,
    },
    /// Job output. Objects merge field-level; anything else lands under `output`.
    Output(Value),
    /// Appended to the `item_errors` array.
    ItemErrors(Vec<ItemFailure>),
}

impl ResultUpdate {
    /// Build a [`ResultUpdate::Fields`] from a JSON object literal.
    ///
    /// Non-object values are wrapped as `{"output": value}`.
    pub fn fields(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Fields(map),
            other => {
                let mut map = Map::new();
                map.insert(OUTPUT_KEY.to_string(), other);
                Self::Fields(map)
            }
        }
    }
}

/// Structured output/context of a task.
///
/// Serializes as a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskResult(Map<String, Value>);

impl TaskResult {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn set(
        &mut self,
        key: String,
        value: Value,
        protected: &BTreeSet<String>,
        rejections: &mut Vec<UpdateRejection>,
    ) {
        if protected.contains(&key) {
            rejections.push(UpdateRejection::ProtectedField(key));
            return;
        }
        self.0.insert(key, value);
    }

    /// Apply one update, skipping protected context keys.
    pub fn apply(
        &mut self,
        update: ResultUpdate,
        protected: &BTreeSet<String>,
    ) -> Vec<UpdateRejection> {
        let mut rejections = Vec::new();

        match update {
            ResultUpdate::Fields(fields) | ResultUpdate::Output(Value::Object(fields)) => {
                for (key, value) in fields {
                    self.set(key, value, protected, &mut rejections);
                }
            }
            ResultUpdate::Output(other) => {
                self.set(OUTPUT_KEY.to_string(), other, protected, &mut rejections);
            }
            ResultUpdate::Progress {
                stage,
                completed,
                total,
            } => {
                self.set(STAGE_KEY.to_string(), Value::from(stage), protected, &mut rejections);
                self.set(
                    ITEMS_COMPLETED_KEY.to_string(),
                    Value::from(completed),
                    protected,
                    &mut rejections,
                );
                self.set(
                    ITEMS_TOTAL_KEY.to_string(),
                    Value::from(total),
                    protected,
                    &mut rejections,
                );
            }
            ResultUpdate::ItemErrors(failures) => {
                if protected.contains(ITEM_ERRORS_KEY) {
                    rejections.push(UpdateRejection::ProtectedField(ITEM_ERRORS_KEY.to_string()));
                    return rejections;
                }
                let entry = self
                    .0
                    .entry(ITEM_ERRORS_KEY.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !entry.is_array() {
                    *entry = Value::Array(Vec::new());
                }
                if let Value::Array(list) = entry {
                    list.extend(failures.iter().map(ItemFailure::to_json));
                }
            }
        }

        rejections
    }
}

/// Part of an update that was not applied.
///
/// Rejections never abort the rest of the update; the manager logs them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateRejection {
    #[error("status transition {from} -> {to} is not allowed")]
    StatusTransition { from: TaskStatus, to: TaskStatus },
    #[error("progress {requested} would move backwards from {current}")]
    ProgressRegression { current: u8, requested: u8 },
    #[error("progress cannot change once the task is {status}")]
    ProgressAfterTerminal { status: TaskStatus },
    #[error("error message ignored: task is {status}, not failed")]
    ErrorWithoutFailure { status: TaskStatus },
    #[error("result field `{0}` is protected task context")]
    ProtectedField(String),
}

/// Partial update of a task; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub result: Option<ResultUpdate>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `pending -> running` with progress reset to 0.
    pub fn running() -> Self {
        Self::new().with_status(TaskStatus::Running).with_progress(0)
    }

    /// Terminal success: progress 100 and the job output merged into `result`.
    pub fn completed(output: Value) -> Self {
        Self::new()
            .with_status(TaskStatus::Completed)
            .with_progress(100)
            .with_result(ResultUpdate::Output(output))
    }

    /// Terminal failure with its message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::new().with_status(TaskStatus::Failed).with_error(error)
    }

    pub fn progress(progress: u8) -> Self {
        Self::new().with_progress(progress)
    }

    pub fn result(result: ResultUpdate) -> Self {
        Self::new().with_result(result)
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_result(mut self, result: ResultUpdate) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A unit of trackable background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Kind of job, e.g. `generate_cases`
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    /// 0..=100
    pub progress: u8,
    pub result: TaskResult,
    /// Set only once the task failed
    pub error: Option<String>,
    /// Result keys seeded at creation; never erased or overwritten
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub context_keys: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task whose `result` is seeded from `params`.
    pub fn new(task_type: impl Into<String>, params: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            progress: 0,
            context_keys: params.keys().cloned().collect(),
            result: TaskResult::from_map(params),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a partial update, returning the parts that were refused.
    ///
    /// Order: status, progress, error, result. `updated_at` is always refreshed.
    pub fn apply(&mut self, update: TaskUpdate) -> Vec<UpdateRejection> {
        let was_terminal = self.status.is_terminal();
        let mut rejections = Vec::new();

        if let Some(next) = update.status {
            if next != self.status {
                if self.status.can_transition_to(next) {
                    self.status = next;
                } else {
                    rejections.push(UpdateRejection::StatusTransition {
                        from: self.status,
                        to: next,
                    });
                }
            }
        }

        if let Some(requested) = update.progress {
            let requested = requested.min(100);
            if was_terminal {
                if requested != self.progress {
                    rejections.push(UpdateRejection::ProgressAfterTerminal {
                        status: self.status,
                    });
                }
            } else if requested < self.progress {
                rejections.push(UpdateRejection::ProgressRegression {
                    current: self.progress,
                    requested,
                });
            } else {
                self.progress = requested;
            }
        }

        if let Some(error) = update.error {
            if self.status == TaskStatus::Failed {
                self.error = Some(error);
            } else {
                rejections.push(UpdateRejection::ErrorWithoutFailure {
                    status: self.status,
                });
            }
        }

        if let Some(result) = update.result {
            rejections.extend(self.result.apply(result, &self.context_keys));
        }

        self.updated_at = Utc::now();
        rejections
    }
}
