//! Workflow Execution Module
//!
//! Provides the engine that runs workflows, the executor contract steps
//! delegate their work to, and the retry wrapper around executor calls.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating workflow runs
//! - [`executor`]: Executor trait, step context and registry
//! - [`retry`]: Retries, backoff, timeouts and cancellation of one step
//! - [`command`]: Built-in `shell` and `echo` executors

pub mod command;
pub mod engine;
pub mod executor;
pub mod retry;

pub use command::{EchoExecutor, ShellExecutor};
pub use engine::{Engine, ExecutionReport};
pub use executor::{Executor, ExecutorError, ExecutorRegistry, StepContext};
pub use retry::{execute_with_retry, StepOutcome};
