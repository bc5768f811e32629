//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating multi-step workflows, and for tracking their execution.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Workflow, Step, RetryPolicy)
//! - [`parser`]: Strict YAML/JSON loading
//! - [`validator`]: Dependency resolution (references, cycles, levels)
//! - [`planner`]: Per-execution step status and ready-set selection
//! - [`state`]: Checkpoint records

pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use model::{Backoff, RetryPolicy, Step, Workflow, WorkflowConfig, WorkflowStatus};
pub use parser::{load_workflow, parse_workflow, save_workflow, ParseError};
pub use planner::{ExecutionPlan, ExecutionStep, ReadyGroups, StepStatus};
pub use state::{ExecutionState, ExecutionStatus, StepRecord};
pub use validator::{compute_levels, find_cycle, validate_workflow, ValidationError};
