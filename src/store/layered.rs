//! Layered Store
//!
//! Writes to a remote backend and fails open to a local one. The first
//! remote failure is logged as a warning; later ones only at debug level.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use super::{newest_first, PersistenceError, StateStore};
use crate::workflow::ExecutionState;

/// Remote-first store with a local fallback.
pub struct LayeredStateStore {
    remote: Arc<dyn StateStore>,
    local: Arc<dyn StateStore>,
    degraded: AtomicBool,
}

impl LayeredStateStore {
    pub fn new(remote: Arc<dyn StateStore>, local: Arc<dyn StateStore>) -> Self {
        Self {
            remote,
            local,
            degraded: AtomicBool::new(false),
        }
    }

    /// Returns true once the remote backend has failed at least once.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn note_failure(&self, operation: &str, error: &PersistenceError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                "Remote checkpoint store '{}' failed to {} ({}); falling back to '{}'",
                self.remote.name(),
                operation,
                error,
                self.local.name()
            );
        } else {
            debug!("Remote {} failed again: {}", operation, error);
        }
    }
}

#[async_trait]
impl StateStore for LayeredStateStore {
    fn name(&self) -> &str {
        "layered"
    }

    async fn save(&self, state: &ExecutionState) -> Result<(), PersistenceError> {
        match self.remote.save(state).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.note_failure("save", &e);
                self.local.save(state).await
            }
        }
    }

    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>, PersistenceError> {
        match self.remote.load(execution_id).await {
            Ok(Some(state)) => Ok(Some(state)),
            // may have been written locally during an outage
            Ok(None) => self.local.load(execution_id).await,
            Err(e) => {
                self.note_failure("load", &e);
                self.local.load(execution_id).await
            }
        }
    }

    async fn list(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionState>, PersistenceError> {
        let local = self.local.list(workflow_id, limit).await?;

        let remote = match self.remote.list(workflow_id, limit).await {
            Ok(states) => states,
            Err(e) => {
                self.note_failure("list", &e);
                return Ok(local);
            }
        };

        // newest update wins when both sides hold the same execution
        let mut merged: HashMap<String, ExecutionState> = HashMap::new();
        for state in remote.into_iter().chain(local) {
            match merged.get(&state.execution_id) {
                Some(existing) if existing.updated_at >= state.updated_at => {}
                _ => {
                    merged.insert(state.execution_id.clone(), state);
                }
            }
        }

        Ok(newest_first(merged.into_values().collect(), limit))
    }
}
