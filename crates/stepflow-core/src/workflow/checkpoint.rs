//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps a `CheckpointStore` to provide the higher-level API the engine
//! uses: writing checkpoints from run snapshots (as the event bus's
//! `CheckpointSink`) and loading the latest checkpoint to resume a run.

use std::future::Future;
use std::pin::Pin;

use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::{RunSnapshot, WorkflowCheckpoint};
use thiserror::Error;
use uuid::Uuid;

use crate::event::persistence::CheckpointSink;
use crate::repository::checkpoint::CheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable checkpoints for workflow runs.
///
/// Generic over `S: CheckpointStore` so it works with any storage backend
/// (JSON files, SQLite, in-memory).
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist a checkpoint.
    pub async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), CheckpointError> {
        self.store.save(checkpoint).await.map_err(|e| match e {
            RepositoryError::Conflict(msg) => CheckpointError::Stale(msg),
            other => CheckpointError::Repository(other.to_string()),
        })?;

        tracing::debug!(
            run_id = %checkpoint.run_id,
            seq = checkpoint.last_event_seq,
            status = %checkpoint.run_status,
            "checkpointed run"
        );
        Ok(())
    }

    /// Build and persist a checkpoint from a run snapshot.
    pub async fn save_snapshot(
        &self,
        snapshot: &RunSnapshot,
        last_event_seq: u64,
    ) -> Result<(), CheckpointError> {
        self.save(&WorkflowCheckpoint::from_snapshot(snapshot, last_event_seq))
            .await
    }

    /// Load the latest checkpoint for a run, failing if there is none.
    pub async fn load(&self, run_id: Uuid) -> Result<WorkflowCheckpoint, CheckpointError> {
        self.store
            .load_latest(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    /// Runs that have a stored checkpoint.
    pub async fn list_runs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        self.store
            .list_runs()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Drop a run's checkpoint, e.g. once it has been audited.
    pub async fn delete(&self, run_id: Uuid) -> Result<bool, CheckpointError> {
        self.store
            .delete(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

impl<S: CheckpointStore> CheckpointSink for CheckpointManager<S> {
    fn write_checkpoint<'a>(
        &'a self,
        checkpoint: WorkflowCheckpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>> {
        Box::pin(async move { self.save(&checkpoint).await })
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// A newer checkpoint for the run is already stored.
    #[error("stale checkpoint: {0}")]
    Stale(String),

    /// No checkpoint stored for the run.
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
