//! Workflow Data Model
//!
//! Core data structures representing workflows, their steps and the
//! per-step execution policies.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: site_build
//! name: Site build
//! version: 1.2.0
//! config:
//!   maxConcurrent: 4
//!   failFast: true
//! steps:
//!   - id: outline
//!     agent: content
//!
//!   - id: palette
//!     agent: design
//!     parallel: true
//!     retryPolicy:
//!       maxAttempts: 3
//!       delay: 500
//!       backoff: exponential
//!
//!   - id: render
//!     agent: template
//!     dependsOn: [outline, palette]
//!     timeout: 60000
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default per-attempt timeout in milliseconds (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 300_000;

/// Default delay between retry attempts in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Lifecycle status of a workflow (and of an execution checkpoint).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Defined but not yet validated
    #[default]
    Draft,
    /// Validated and waiting to run
    Ready,
    /// Steps are being scheduled
    Running,
    /// Scheduling halted by an external pause
    Paused,
    /// Every step finished
    Completed,
    /// A non-optional step failed
    Failed,
}

impl WorkflowStatus {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Checks whether the engine may move a workflow from `self` to `next`.
    ///
    /// Besides the main `draft -> ready -> running -> completed|failed` path
    /// and `running <-> paused`, any non-running workflow may be re-validated
    /// back to `ready` for a new execution, and a paused or failed run may
    /// be resumed straight into `running`.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        match (self, next) {
            (Running, Ready) => false,
            (_, Ready) => true,
            (Ready, Running) | (Paused, Running) | (Failed, Running) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// How the wait between retry attempts grows.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `delay * n` after the n-th failed attempt
    Linear,
    /// `delay * 2^(n-1)` after the n-th failed attempt
    #[default]
    Exponential,
}

/// Retry settings attached to a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub delay: u64,

    /// Growth of the delay across attempts
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: DEFAULT_RETRY_DELAY_MS,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempts, base delay and backoff.
    pub fn new(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            delay: delay.as_millis() as u64,
            backoff,
        }
    }

    /// Returns the wait after the `failed_attempt`-th attempt failed.
    ///
    /// `failed_attempt` is 1-based. With `delay = 100` both modes wait
    /// 100 ms after the first failure; the second wait is 200 ms for both,
    /// the third 300 ms (linear) or 400 ms (exponential).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let attempt = failed_attempt.max(1);
        let millis = match self.backoff {
            Backoff::Linear => self.delay.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.delay.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Represents a single step in a workflow.
///
/// A step names the executor ("agent") that performs its work, the steps
/// it waits for, and how failures are retried.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Registry key of the executor that runs this step
    #[serde(rename = "agent")]
    pub executor: String,

    /// Free-form description for humans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// IDs of steps that must complete before this step can run
    #[serde(default, deserialize_with = "single_or_vec")]
    pub depends_on: Vec<String>,

    /// Opt-in to running alongside other ready parallel steps
    #[serde(default)]
    pub parallel: bool,

    /// A failure of this step does not fail the workflow
    #[serde(default)]
    pub optional: bool,

    /// Retry settings
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Executor-specific parameters
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

fn default_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in dependsOn array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl Step {
    /// Creates a new Step bound to an executor key.
    ///
    /// # Example
    ///
    /// ```
    /// use stepweaver::workflow::Step;
    ///
    /// let step = Step::new("render", "template")
    ///     .depends_on("outline")
    ///     .depends_on("palette")
    ///     .optional();
    /// assert_eq!(step.depends_on.len(), 2);
    /// ```
    pub fn new(id: impl Into<String>, executor: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            executor: executor.into().trim().to_string(),
            description: None,
            depends_on: Vec::new(),
            parallel: false,
            optional: false,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_STEP_TIMEOUT_MS,
            params: Value::Null,
        }
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Marks the step as parallel-eligible.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Marks the step as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_millis() as u64;
        self
    }

    /// Sets the executor parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Returns the per-attempt timeout as a `Duration`.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Workflow-wide execution settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Upper bound on concurrently running steps
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Cancel in-flight siblings as soon as a non-optional step fails
    #[serde(default = "default_true")]
    pub fail_fast: bool,

    /// Persist checkpoints to the durable state store
    #[serde(default = "default_true")]
    pub save_state: bool,
}

fn default_max_concurrent() -> usize {
    num_cpus::get().max(1)
}

fn default_true() -> bool {
    true
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            fail_fast: true,
            save_state: true,
        }
    }
}

/// Represents a complete workflow with multiple steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Workflow {
    /// Unique workflow identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Definition version
    #[serde(default = "default_version")]
    pub version: String,

    /// Steps in declaration order
    pub steps: Vec<Step>,

    /// Execution settings
    #[serde(default)]
    pub config: WorkflowConfig,

    /// Lifecycle status (mutated only by the engine)
    #[serde(default)]
    pub status: WorkflowStatus,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            steps: Vec::new(),
            config: WorkflowConfig::default(),
            status: WorkflowStatus::Draft,
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(id: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut workflow = Self::new(id);
        workflow.steps = steps;
        workflow
    }

    /// Replaces the execution settings.
    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Returns the IDs of steps that list `id` as a dependency.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == id))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Returns steps nothing depends on (exit points).
    pub fn leaf_steps(&self) -> Vec<&Step> {
        let referenced: HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();

        self.steps
            .iter()
            .filter(|s| !referenced.contains(s.id.as_str()))
            .collect()
    }

    /// Returns the sorted list of distinct executor keys used.
    pub fn executors(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .steps
            .iter()
            .map(|s| s.executor.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort();
        keys
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
