//! Durable progress snapshots.
//!
//! One JSON file per batch id inside a directory. Files are replaced
//! atomically (written to a temporary file in the same directory, then
//! renamed over the old snapshot), so a crash mid-batch leaves the last
//! complete snapshot behind for a restarted viewer.

use crate::error::EngineError;
use crate::model::ProgressState;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EngineError::DirectoryCreationFailed {
            path: dir.clone(),
            source: e,
        })?;
        Ok(ProgressStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, batch_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", batch_id))
    }

    fn persistence_error(&self, path: &Path, message: impl ToString) -> EngineError {
        EngineError::Persistence {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    /// Atomically replace the snapshot of `state.batch_id`.
    pub fn save(&self, state: &ProgressState) -> Result<(), EngineError> {
        let target = self.path_for(state.batch_id);
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| self.persistence_error(&target, e))?;
        serde_json::to_writer_pretty(&mut tmp, state).map_err(|e| self.persistence_error(&target, e))?;
        tmp.flush().map_err(|e| self.persistence_error(&target, e))?;
        tmp.persist(&target)
            .map_err(|e| self.persistence_error(&target, e.error))?;
        Ok(())
    }

    /// Last saved snapshot of a batch, if any.
    pub fn load(&self, batch_id: Uuid) -> Result<Option<ProgressState>, EngineError> {
        let path = self.path_for(batch_id);
        match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| self.persistence_error(&path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.persistence_error(&path, e)),
        }
    }

    /// All readable snapshots, most recently updated first.
    ///
    /// Unreadable or foreign files in the directory are ignored.
    pub fn list(&self) -> Result<Vec<ProgressState>, EngineError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| self.persistence_error(&self.dir, e))?;
        let mut states: Vec<ProgressState> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| fs::read_to_string(path).ok())
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect();
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }

    /// Forget a batch. Removing an unknown batch is not an error.
    pub fn remove(&self, batch_id: Uuid) -> Result<(), EngineError> {
        let path = self.path_for(batch_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.persistence_error(&path, e)),
        }
    }
}
