//! Checkpoint Storage Module
//!
//! Durable persistence of [`ExecutionState`] checkpoints behind the
//! [`StateStore`] trait.
//!
//! # Backends
//!
//! - [`FileStateStore`]: one JSON file per execution, atomic writes
//! - [`MemoryStateStore`]: process-local map, used in tests and as a mirror
//! - [`LayeredStateStore`]: remote backend failing open to a local one
//!
//! The engine talks to its store through a [`Checkpointer`], which retries
//! failed writes and degrades to memory when the backend stays down.

pub mod checkpoint;
pub mod layered;
pub mod local;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::workflow::ExecutionState;

pub use checkpoint::Checkpointer;
pub use layered::LayeredStateStore;
pub use local::FileStateStore;
pub use memory::MemoryStateStore;

/// Errors raised by checkpoint backends.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Checkpoint I/O failed for '{}': {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint '{id}' could not be decoded: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint '{id}' could not be encoded: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid execution id '{0}'")]
    InvalidId(String),

    #[error("Checkpoint backend unavailable: {0}")]
    Unavailable(String),
}

/// A pluggable checkpoint backend.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Persists a checkpoint, replacing any previous one for the execution.
    ///
    /// A failed save must leave the previous checkpoint intact.
    async fn save(&self, state: &ExecutionState) -> Result<(), PersistenceError>;

    /// Loads the last checkpoint of an execution, `None` if there is none.
    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>, PersistenceError>;

    /// Returns the checkpoints of a workflow, newest `startedAt` first.
    async fn list(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionState>, PersistenceError>;
}

/// Sorts checkpoints newest first and keeps at most `limit` of them.
pub(crate) fn newest_first(mut states: Vec<ExecutionState>, limit: usize) -> Vec<ExecutionState> {
    states.sort_by(|a, b| {
        b.started_at
            .cmp(&a.started_at)
            .then_with(|| a.execution_id.cmp(&b.execution_id))
    });
    states.truncate(limit);
    states
}
