//! Stepweaver - Checkpointing Workflow Execution Engine
//!
//! Runs workflows made of steps with explicit dependencies. Each step is
//! delegated to a pluggable executor; independent steps can run in bounded
//! parallel groups, failures are retried with backoff, and every finished
//! step is checkpointed so an interrupted execution can be resumed.
//!
//! # Architecture
//!
//! - [`workflow`]: Definitions, parsing, validation and execution state
//! - [`execution`]: The engine, the executor contract and the retry wrapper
//! - [`store`]: Checkpoint persistence (memory, files, layered fallback)
//! - [`resources`]: Shared budget, result cache and output optimizer
//! - [`monitoring`]: Per-execution timeline
//! - [`error`]: Engine error type
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stepweaver::execution::{Engine, ShellExecutor};
//! use stepweaver::store::FileStateStore;
//! use stepweaver::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("site.yaml")?;
//!
//!     // Checkpoint to disk so failed runs can be resumed
//!     let engine = Engine::new().with_state_store(Arc::new(FileStateStore::new(".stepweaver/executions")));
//!     engine.register_executor("shell", Arc::new(ShellExecutor::new()));
//!
//!     let report = engine.run_workflow(workflow, serde_json::json!({})).await?;
//!     println!("{} finished: {}", report.execution_id, report.status);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod resources;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use error::EngineError;
pub use execution::{Engine, ExecutionReport, Executor, ExecutorError, StepContext};
pub use workflow::{load_workflow, parse_workflow, Step, Workflow, WorkflowStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Stepweaver";
