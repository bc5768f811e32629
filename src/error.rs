//! Engine error taxonomy.

use thiserror::Error;

use crate::execution::executor::ExecutorError;
use crate::resources::BudgetExceeded;
use crate::store::PersistenceError;
use crate::workflow::{ParseError, ValidationError};

/// Errors returned by [`Engine`](crate::Engine) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("No executor registered for agent '{executor}' (step '{step_id}')")]
    AgentNotFound { step_id: String, executor: String },

    #[error("Step '{step_id}' failed after {attempts} attempt(s): {source}")]
    StepExecution {
        step_id: String,
        attempts: u32,
        #[source]
        source: ExecutorError,
    },

    #[error("No runnable steps left; stuck on: {}", .steps.join(", "))]
    CircularDependency { steps: Vec<String> },

    #[error("Step '{step_id}' stopped: {source}")]
    BudgetExceeded {
        step_id: String,
        #[source]
        source: BudgetExceeded,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Workflow '{0}' is not registered")]
    WorkflowNotFound(String),

    #[error("No execution '{0}'")]
    ExecutionNotFound(String),

    #[error("Workflow '{0}' is already running")]
    WorkflowBusy(String),

    #[error("Execution '{0}' already exists")]
    ExecutionExists(String),

    #[error("Step '{step_id}' was cancelled")]
    Cancelled { step_id: String },
}

impl EngineError {
    /// ID of the step the error is attributed to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::AgentNotFound { step_id, .. }
            | Self::StepExecution { step_id, .. }
            | Self::BudgetExceeded { step_id, .. }
            | Self::Cancelled { step_id } => Some(step_id),
            _ => None,
        }
    }
}
