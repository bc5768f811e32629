//! Execution State
//!
//! The checkpoint record of one workflow execution. A fresh state is
//! created when an execution starts and is persisted through a
//! [`StateStore`](crate::store::StateStore) after every step, making it the
//! source of truth for resume and status queries.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::model::WorkflowStatus;

/// Outcome of a single step as stored in a checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// ID of the step
    pub step_id: String,

    /// Executor output (absent when the step failed; a `null` output is kept)
    #[serde(default, deserialize_with = "present_output", skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Failure message (optional failures and the fatal step)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Number of executor invocations
    pub attempts: u32,

    /// Wall-clock time spent on the step, retries included
    pub duration_ms: u64,

    /// When the step reached its terminal state
    pub finished_at: DateTime<Utc>,
}

/// A present `output` field is an output, even when it is `null`.
fn present_output<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl StepRecord {
    /// Creates a record for a successful step.
    pub fn success(step_id: impl Into<String>, output: Value, attempts: u32, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            output: Some(output),
            error: None,
            attempts,
            duration_ms,
            finished_at: Utc::now(),
        }
    }

    /// Creates a record for a failed step.
    pub fn failure(step_id: impl Into<String>, error: impl Into<String>, attempts: u32, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            output: None,
            error: Some(error.into()),
            attempts,
            duration_ms,
            finished_at: Utc::now(),
        }
    }

    /// Returns true if the step produced an output.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Persistent state for a workflow execution.
///
/// Tracks which steps have completed and their results, allowing
/// execution to resume from the last checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// Unique ID of this execution
    pub execution_id: String,

    /// ID of the workflow being executed
    pub workflow_id: String,

    /// Steps that reached `completed` (optional failures included)
    pub completed_steps: BTreeSet<String>,

    /// Recorded result per step
    pub step_results: BTreeMap<String, StepRecord>,

    /// Overall status of the execution
    pub status: WorkflowStatus,

    /// Number of steps in the workflow
    pub total_steps: usize,

    /// Caller-supplied input, replayed on resume
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,

    /// When the execution started
    pub started_at: DateTime<Utc>,

    /// Last time the state was updated
    pub updated_at: DateTime<Utc>,

    /// When the execution reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Error that failed the execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionState {
    /// Creates a new running state for an execution.
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        total_steps: usize,
        context: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            completed_steps: BTreeSet::new(),
            step_results: BTreeMap::new(),
            status: WorkflowStatus::Running,
            total_steps,
            context,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Records a step that finished, successfully or as an optional failure.
    pub fn mark_completed(&mut self, record: StepRecord) {
        self.completed_steps.insert(record.step_id.clone());
        self.step_results.insert(record.step_id.clone(), record);
        self.touch();
    }

    /// Records the failure of a step without completing it.
    pub fn mark_step_failed(&mut self, record: StepRecord) {
        self.completed_steps.remove(&record.step_id);
        self.step_results.insert(record.step_id.clone(), record);
        self.touch();
    }

    /// Moves the execution to a terminal status.
    pub fn finish(&mut self, status: WorkflowStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Changes a non-terminal status (running, paused).
    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        if !status.is_terminal() {
            self.completed_at = None;
            self.error = None;
        }
        self.touch();
    }

    /// Returns true if this state holds progress worth resuming from.
    pub fn is_resume(&self) -> bool {
        !self.completed_steps.is_empty() || self.error.is_some()
    }

    /// Returns the progress as (completed, total).
    pub fn progress(&self) -> (usize, usize) {
        (self.completed_steps.len(), self.total_steps)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Summary returned by status queries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    /// Status of the last checkpoint
    pub status: WorkflowStatus,
    /// Number of completed steps
    pub completed_steps: usize,
    /// Number of steps in the workflow
    pub total_steps: usize,
}

impl From<&ExecutionState> for ExecutionStatus {
    fn from(state: &ExecutionState) -> Self {
        let (completed_steps, total_steps) = state.progress();
        Self {
            status: state.status,
            completed_steps,
            total_steps,
        }
    }
}
