//! JSON-file checkpoint store.
//!
//! One file per run at `{dir}/{run_id}.json`. Writes go to a temporary file
//! first and are renamed into place, so a crash never leaves a torn
//! checkpoint behind.

use std::path::{Path, PathBuf};

use stepflow_core::repository::checkpoint::{CheckpointStore, check_supersedes};
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::WorkflowCheckpoint;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    /// Serialises read-check-write so stale writes are detected.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Store rooted at `dir`, created if missing.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RepositoryError::Io(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    async fn read(&self, path: &Path) -> Result<Option<WorkflowCheckpoint>, RepositoryError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RepositoryError::Io(format!("read {}: {e}", path.display())));
            }
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            RepositoryError::Serialization(format!("invalid checkpoint {}: {e}", path.display()))
        })
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), RepositoryError> {
        let path = self.path_for(&checkpoint.run_id);
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        if let Some(current) = self.read(&path).await? {
            check_supersedes(&current, checkpoint)?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| RepositoryError::Io(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RepositoryError::Io(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    async fn load_latest(&self, run_id: &Uuid) -> Result<Option<WorkflowCheckpoint>, RepositoryError> {
        self.read(&self.path_for(run_id)).await
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| RepositoryError::Io(format!("list {}: {e}", self.dir.display())))?;

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RepositoryError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<Uuid>) {
                Some(Ok(run_id)) => runs.push(run_id),
                _ => tracing::debug!(path = %path.display(), "ignoring non-checkpoint file"),
            }
        }
        runs.sort();
        Ok(runs)
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RepositoryError::Io(e.to_string())),
        }
    }
}
