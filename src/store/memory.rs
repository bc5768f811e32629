//! In-memory checkpoint store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{newest_first, PersistenceError, StateStore};
use crate::workflow::ExecutionState;

/// Keeps checkpoints in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, ExecutionState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a checkpoint without going through the async trait.
    pub fn insert(&self, state: ExecutionState) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.execution_id.clone(), state);
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }

    pub fn remove(&self, execution_id: &str) -> Option<ExecutionState> {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id)
    }

    /// All checkpoints of a workflow, unordered.
    pub fn for_workflow(&self, workflow_id: &str) -> Vec<ExecutionState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|state| state.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, state: &ExecutionState) -> Result<(), PersistenceError> {
        self.insert(state.clone());
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>, PersistenceError> {
        Ok(self.get(execution_id))
    }

    async fn list(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionState>, PersistenceError> {
        Ok(newest_first(self.for_workflow(workflow_id), limit))
    }
}
