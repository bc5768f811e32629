//! Local File Store
//!
//! Checkpoints are saved as `{dir}/{execution_id}.json`. Each save writes
//! a uniquely named temporary file next to the target and renames it into
//! place, so a crash mid-write never corrupts the previous checkpoint.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::fs;

use super::{newest_first, PersistenceError, StateStore};
use crate::workflow::ExecutionState;

/// File extension of checkpoint files.
const CHECKPOINT_EXT: &str = "json";

/// Stores one pretty-printed JSON checkpoint per execution.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Creates a store rooted at `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the checkpoint path of an execution.
    pub fn checkpoint_path(&self, execution_id: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !execution_id.is_empty()
            && execution_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if !valid {
            return Err(PersistenceError::InvalidId(execution_id.to_string()));
        }

        Ok(self.dir.join(format!("{}.{}", execution_id, CHECKPOINT_EXT)))
    }

    fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn save(&self, state: &ExecutionState) -> Result<(), PersistenceError> {
        let path = self.checkpoint_path(&state.execution_id)?;

        let json = serde_json::to_vec_pretty(state).map_err(|source| PersistenceError::Encode {
            id: state.execution_id.clone(),
            source,
        })?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;

        let tmp_path = self
            .dir
            .join(format!(".{}.{}.tmp", state.execution_id, uuid::Uuid::new_v4().simple()));

        if let Err(e) = fs::write(&tmp_path, &json).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Self::io_error(&tmp_path, e));
        }

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Self::io_error(&path, e));
        }

        debug!("Saved checkpoint to {}", path.display());
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>, PersistenceError> {
        let path = self.checkpoint_path(execution_id)?;

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&path, e)),
        };

        let state = serde_json::from_slice(&content).map_err(|source| PersistenceError::Corrupt {
            id: execution_id.to_string(),
            source,
        })?;

        debug!("Loaded checkpoint from {}", path.display());
        Ok(Some(state))
    }

    async fn list(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionState>, PersistenceError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&self.dir, e)),
        };

        let mut states = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }

            let parsed = match fs::read(&path).await {
                Ok(content) => serde_json::from_slice::<ExecutionState>(&content).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match parsed {
                Ok(state) if state.workflow_id == workflow_id => states.push(state),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }

        Ok(newest_first(states, limit))
    }
}
