//! Checkpoint store trait definition and in-memory implementation.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::WorkflowCheckpoint;
use uuid::Uuid;

/// Storage for workflow checkpoints, one latest checkpoint per run.
///
/// Implementations keep only the checkpoint with the highest
/// `last_event_seq` for each run and reject older ones with
/// `RepositoryError::Conflict`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Store `checkpoint`, superseding any older checkpoint for the same run.
    fn save(
        &self,
        checkpoint: &WorkflowCheckpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Latest checkpoint for a run, if any.
    fn load_latest(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowCheckpoint>, RepositoryError>> + Send;

    /// IDs of every run with a stored checkpoint, oldest first.
    fn list_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Delete a run's checkpoint. Returns `true` if it existed.
    fn delete(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

/// Reject `incoming` if `current` is newer.
pub fn check_supersedes(
    current: &WorkflowCheckpoint,
    incoming: &WorkflowCheckpoint,
) -> Result<(), RepositoryError> {
    if incoming.last_event_seq < current.last_event_seq {
        return Err(RepositoryError::Conflict(format!(
            "stale checkpoint for run {}: seq {} < stored seq {}",
            incoming.run_id, incoming.last_event_seq, current.last_event_seq
        )));
    }
    Ok(())
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<Uuid, WorkflowCheckpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), RepositoryError> {
        match self.checkpoints.entry(checkpoint.run_id) {
            Entry::Occupied(mut entry) => {
                check_supersedes(entry.get(), checkpoint)?;
                entry.insert(checkpoint.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(checkpoint.clone());
            }
        }
        Ok(())
    }

    async fn load_latest(&self, run_id: &Uuid) -> Result<Option<WorkflowCheckpoint>, RepositoryError> {
        Ok(self.checkpoints.get(run_id).map(|c| c.clone()))
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>, RepositoryError> {
        // UUIDv7 run IDs sort by creation time.
        let mut runs: Vec<Uuid> = self.checkpoints.iter().map(|c| *c.key()).collect();
        runs.sort();
        Ok(runs)
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.checkpoints.remove(run_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stepflow_types::workflow::{RunSnapshot, RunStatus, StepSnapshot};

    fn checkpoint(run_id: Uuid, seq: u64) -> WorkflowCheckpoint {
        let snapshot = RunSnapshot {
            run_id,
            plan_id: Uuid::nil(),
            status: RunStatus::Running,
            steps: BTreeMap::from([(1, StepSnapshot::pending())]),
        };
        WorkflowCheckpoint::from_snapshot(&snapshot, seq)
    }

    #[tokio::test]
    async fn test_latest_wins_and_stale_rejected() {
        let store = InMemoryCheckpointStore::new();
        let run = Uuid::now_v7();
        store.save(&checkpoint(run, 3)).await.unwrap();
        store.save(&checkpoint(run, 7)).await.unwrap();

        let err = store.save(&checkpoint(run, 5)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(store.load_latest(&run).await.unwrap().unwrap().last_event_seq, 7);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = InMemoryCheckpointStore::new();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        store.save(&checkpoint(second, 1)).await.unwrap();
        store.save(&checkpoint(first, 1)).await.unwrap();
        assert_eq!(store.list_runs().await.unwrap(), vec![first, second]);

        assert!(store.delete(&first).await.unwrap());
        assert!(!store.delete(&first).await.unwrap());
        assert!(store.load_latest(&first).await.unwrap().is_none());
    }
}
