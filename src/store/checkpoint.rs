//! Checkpointer
//!
//! The engine's single writer of checkpoints. Every checkpoint is mirrored
//! in memory first, then written to the durable store with a bounded
//! number of attempts. An execution whose durable writes keep failing is
//! degraded: it continues on the in-memory mirror only, and the first
//! degradation is logged as a warning. Once a terminal checkpoint reaches
//! the durable store the execution is retired from the mirror.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use super::{newest_first, MemoryStateStore, PersistenceError, StateStore};
use crate::workflow::ExecutionState;

/// Durable write attempts before an execution is degraded.
pub const WRITE_ATTEMPTS: u32 = 3;

/// Pause between durable write attempts.
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Where a checkpoint ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Written to the durable store
    Durable,
    /// Held only in the in-memory mirror
    MemoryOnly,
}

/// Serializes checkpoint writes for an engine.
pub struct Checkpointer {
    store: Arc<dyn StateStore>,
    mirror: MemoryStateStore,
    degraded: Mutex<HashSet<String>>,
    warned: AtomicBool,
    attempts: u32,
    retry_delay: Duration,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            mirror: MemoryStateStore::new(),
            degraded: Mutex::new(HashSet::new()),
            warned: AtomicBool::new(false),
            attempts: WRITE_ATTEMPTS,
            retry_delay: WRITE_RETRY_DELAY,
        }
    }

    /// Overrides the write retry settings.
    pub fn with_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// The durable backend.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Returns true if the execution fell back to the in-memory mirror.
    pub fn is_degraded(&self, execution_id: &str) -> bool {
        self.degraded_set().contains(execution_id)
    }

    /// Records a checkpoint.
    ///
    /// With `durable = false` the checkpoint is kept in memory only. Durable
    /// write failures never surface: after the last attempt the execution
    /// is degraded and the returned [`Durability`] says so.
    pub async fn persist(&self, state: &ExecutionState, durable: bool) -> Durability {
        self.mirror.insert(state.clone());

        if !durable || self.is_degraded(&state.execution_id) {
            return Durability::MemoryOnly;
        }

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.store.save(state).await {
                Ok(()) => {
                    debug!(
                        "Checkpoint {} saved ({}/{} steps, {})",
                        state.execution_id,
                        state.completed_steps.len(),
                        state.total_steps,
                        state.status
                    );
                    if state.status.is_terminal() {
                        // the store now holds the final record
                        self.mirror.remove(&state.execution_id);
                    }
                    return Durability::Durable;
                }
                Err(e) => {
                    debug!(
                        "Checkpoint write {}/{} for {} failed: {}",
                        attempt, self.attempts, state.execution_id, e
                    );
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.degraded_set().insert(state.execution_id.clone());

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                "Checkpoint store '{}' unavailable ({}); execution {} continues in memory only",
                self.store.name(),
                reason,
                state.execution_id
            );
        } else {
            debug!("Execution {} degraded to memory: {}", state.execution_id, reason);
        }

        Durability::MemoryOnly
    }

    /// Loads the latest checkpoint, preferring the in-memory mirror.
    pub async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>, PersistenceError> {
        if let Some(state) = self.mirror.get(execution_id) {
            return Ok(Some(state));
        }
        self.store.load(execution_id).await
    }

    /// Lists checkpoints of a workflow from the store and the mirror.
    ///
    /// Mirror entries win over stored ones. A failing store is logged and
    /// the mirror alone is returned.
    pub async fn list(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionState>, PersistenceError> {
        let mut states = self.mirror.for_workflow(workflow_id);
        let known: HashSet<String> = states.iter().map(|s| s.execution_id.clone()).collect();

        match self.store.list(workflow_id, limit.saturating_add(known.len())).await {
            Ok(stored) => states.extend(stored.into_iter().filter(|s| !known.contains(&s.execution_id))),
            Err(e) => warn!("Listing checkpoints from '{}' failed: {}", self.store.name(), e),
        }

        Ok(newest_first(states, limit))
    }

    fn degraded_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.degraded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStateStore;
    use crate::workflow::WorkflowStatus;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    /// Fails the first `failures` saves, then delegates to memory.
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
        inner: MemoryStateStore,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                inner: MemoryStateStore::new(),
            }
        }
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn save(&self, state: &ExecutionState) -> Result<(), PersistenceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(PersistenceError::Unavailable(format!("call {}", call)));
            }
            self.inner.save(state).await
        }

        async fn load(&self, id: &str) -> Result<Option<ExecutionState>, PersistenceError> {
            self.inner.load(id).await
        }

        async fn list(&self, wf: &str, limit: usize) -> Result<Vec<ExecutionState>, PersistenceError> {
            self.inner.list(wf, limit).await
        }
    }

    fn state(id: &str) -> ExecutionState {
        ExecutionState::new(id, "wf", 2, Value::Null)
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let store = Arc::new(FlakyStore::new(2));
        let checkpointer = Checkpointer::new(store.clone()).with_retry(3, Duration::from_millis(1));

        let durability = checkpointer.persist(&state("e1"), true).await;

        assert_eq!(durability, Durability::Durable);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.inner.get("e1").is_some());
    }

    #[tokio::test]
    async fn test_degrades_after_bounded_attempts() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let checkpointer = Checkpointer::new(store.clone()).with_retry(3, Duration::from_millis(1));

        assert_eq!(checkpointer.persist(&state("e1"), true).await, Durability::MemoryOnly);
        assert!(checkpointer.is_degraded("e1"));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);

        // degraded executions stop hitting the store
        checkpointer.persist(&state("e1"), true).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);

        assert!(checkpointer.load("e1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_durable_stays_in_memory() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path()));
        let checkpointer = Checkpointer::new(store.clone());

        assert_eq!(checkpointer.persist(&state("e1"), false).await, Durability::MemoryOnly);
        assert!(store.load("e1").await.unwrap().is_none());
        assert!(checkpointer.load("e1").await.unwrap().is_some());
        assert!(!checkpointer.is_degraded("e1"));
    }

    #[tokio::test]
    async fn test_finished_execution_retired_from_mirror() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path()));
        let checkpointer = Checkpointer::new(store.clone());

        let mut running = state("e1");
        checkpointer.persist(&running, true).await;
        assert!(checkpointer.mirror.get("e1").is_some());

        running.finish(WorkflowStatus::Completed, None);
        assert_eq!(checkpointer.persist(&running, true).await, Durability::Durable);
        assert!(checkpointer.mirror.is_empty());

        // only the durable copy remains
        std::fs::remove_dir_all(dir.path()).unwrap();
        assert!(checkpointer.load("e1").await.unwrap().is_none());
        assert!(checkpointer.list("wf", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_only_execution_kept_after_finish() {
        let store = Arc::new(MemoryStateStore::new());
        let checkpointer = Checkpointer::new(store.clone());

        let mut finished = state("e1");
        finished.finish(WorkflowStatus::Failed, Some("boom".into()));
        checkpointer.persist(&finished, false).await;

        assert!(store.is_empty());
        assert_eq!(checkpointer.load("e1").await.unwrap(), Some(finished));
    }

    #[tokio::test]
    async fn test_load_reads_store_when_not_mirrored() {
        let store = Arc::new(MemoryStateStore::new());
        store.insert(state("elsewhere"));

        let checkpointer = Checkpointer::new(store);
        assert!(checkpointer.load("elsewhere").await.unwrap().is_some());
        assert!(checkpointer.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_merges_mirror_and_store() {
        let store = Arc::new(MemoryStateStore::new());
        store.insert(state("stored"));

        let checkpointer = Checkpointer::new(store);
        checkpointer.persist(&state("mirrored"), false).await;

        let mut ids: Vec<_> = checkpointer
            .list("wf", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.execution_id)
            .collect();
        ids.sort();

        assert_eq!(ids, vec!["mirrored", "stored"]);
    }
}
