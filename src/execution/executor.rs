//! Executor Contract
//!
//! Steps delegate their work to executors ("agents") looked up by key in an
//! [`ExecutorRegistry`]. An executor receives the step definition and a
//! [`StepContext`] carrying the execution's input, the outputs of the
//! step's dependencies and the shared budget and optimizer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use thiserror::Error;

use crate::resources::{Budget, BudgetExceeded, BudgetTracker, Optimizer, SharedResources};
use crate::workflow::Step;

/// Failure reported by an executor attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Ordinary failure, retried per the step's policy
    #[error("{0}")]
    Failed(String),

    /// The attempt exceeded the step timeout
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// The shared budget rejected a charge; never retried
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    /// The attempt or its retry wait was interrupted
    #[error("cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Convenience constructor for [`ExecutorError::Failed`].
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_))
    }
}

/// Everything an executor may read while running a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: String,
    pub workflow_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Caller-supplied input of the execution
    pub input: Arc<Value>,
    /// Outputs of the step's completed dependencies, keyed by step ID
    pub dependencies: BTreeMap<String, Value>,
    pub resources: SharedResources,
}

impl StepContext {
    /// Creates a context for the first attempt of a step.
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        input: Arc<Value>,
        resources: SharedResources,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            attempt: 1,
            input,
            dependencies: BTreeMap::new(),
            resources,
        }
    }

    /// Output of a dependency, if it completed with one.
    pub fn dependency(&self, step_id: &str) -> Option<&Value> {
        self.dependencies.get(step_id)
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.resources.budget
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.resources.optimizer
    }

    /// Charges the shared budget.
    pub fn track_usage(&self, amount: u64) -> Result<Budget, ExecutorError> {
        Ok(self.resources.budget.track_usage(amount)?)
    }
}

/// Performs the work of a step.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs one attempt of `step` and returns its output.
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<Value, ExecutorError>;
}

/// Maps agent keys to executors.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor, returning the one it replaced.
    pub fn register(&self, key: impl Into<String>, executor: Arc<dyn Executor>) -> Option<Arc<dyn Executor>> {
        let key = key.into();
        debug!("Registering executor '{}'", key);
        self.executors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, executor)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry").field("keys", &self.keys()).finish()
    }
}
