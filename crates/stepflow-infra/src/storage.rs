//! Checkpoint backend selected from `StorageConfig`.

use stepflow_core::repository::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use stepflow_types::config::StorageConfig;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::WorkflowCheckpoint;
use uuid::Uuid;

use crate::file::FileCheckpointStore;
use crate::sqlite::{DatabasePool, SqliteCheckpointStore};

/// Any of the built-in checkpoint stores.
///
/// `CheckpointStore` is not object safe, so runtime backend selection goes
/// through this enum instead of a trait object.
pub enum AnyCheckpointStore {
    Memory(InMemoryCheckpointStore),
    File(FileCheckpointStore),
    Sqlite(SqliteCheckpointStore),
}

impl AnyCheckpointStore {
    /// Open the backend described by `config`.
    pub async fn connect(config: &StorageConfig) -> Result<Self, RepositoryError> {
        let store = match config {
            StorageConfig::Memory => Self::Memory(InMemoryCheckpointStore::new()),
            StorageConfig::File { dir } => Self::File(FileCheckpointStore::new(dir.clone()).await?),
            StorageConfig::Sqlite { url } => {
                let pool = DatabasePool::new(url)
                    .await
                    .map_err(|e| RepositoryError::Connection(e.to_string()))?;
                Self::Sqlite(SqliteCheckpointStore::new(pool))
            }
        };
        tracing::info!(backend = store.backend(), "checkpoint store ready");
        Ok(store)
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::File(_) => "file",
            Self::Sqlite(_) => "sqlite",
        }
    }
}

impl CheckpointStore for AnyCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), RepositoryError> {
        match self {
            Self::Memory(s) => s.save(checkpoint).await,
            Self::File(s) => s.save(checkpoint).await,
            Self::Sqlite(s) => s.save(checkpoint).await,
        }
    }

    async fn load_latest(&self, run_id: &Uuid) -> Result<Option<WorkflowCheckpoint>, RepositoryError> {
        match self {
            Self::Memory(s) => s.load_latest(run_id).await,
            Self::File(s) => s.load_latest(run_id).await,
            Self::Sqlite(s) => s.load_latest(run_id).await,
        }
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>, RepositoryError> {
        match self {
            Self::Memory(s) => s.list_runs().await,
            Self::File(s) => s.list_runs().await,
            Self::Sqlite(s) => s.list_runs().await,
        }
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        match self {
            Self::Memory(s) => s.delete(run_id).await,
            Self::File(s) => s.delete(run_id).await,
            Self::Sqlite(s) => s.delete(run_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use stepflow_core::event::EventBus;
    use stepflow_core::workflow::checkpoint::CheckpointManager;
    use stepflow_core::workflow::executor::ParallelExecutor;
    use stepflow_core::workflow::retry::RetryManager;
    use stepflow_core::workflow::runner::{FnRunner, StepContext};
    use stepflow_types::config::{EventBusConfig, ExecutorConfig, RetryConfig};
    use stepflow_types::worker::{WorkerError, WorkerOutput};
    use stepflow_types::workflow::{
        Plan, RunSnapshot, RunStatus, Step, StepSnapshot, StepStatus, WorkerKind,
    };
    use tokio_util::sync::CancellationToken;

    fn checkpoint(run_id: Uuid, seq: u64) -> WorkflowCheckpoint {
        let snapshot = RunSnapshot {
            run_id,
            plan_id: Uuid::now_v7(),
            status: RunStatus::Running,
            steps: BTreeMap::from([(1, StepSnapshot::pending())]),
        };
        WorkflowCheckpoint::from_snapshot(&snapshot, seq)
    }

    #[tokio::test]
    async fn test_every_backend_honours_the_contract() {
        let dir = tempfile::tempdir().unwrap();
        let configs = [
            StorageConfig::Memory,
            StorageConfig::File {
                dir: dir.path().join("files"),
            },
            StorageConfig::Sqlite {
                url: format!("sqlite://{}?mode=rwc", dir.path().join("cp.db").display()),
            },
        ];
        for config in &configs {
            let store = AnyCheckpointStore::connect(config).await.unwrap();
            let run = Uuid::now_v7();
            store.save(&checkpoint(run, 5)).await.unwrap();
            assert!(
                matches!(
                    store.save(&checkpoint(run, 1)).await,
                    Err(RepositoryError::Conflict(_))
                ),
                "{} must reject stale checkpoints",
                store.backend()
            );
            assert_eq!(
                store.load_latest(&run).await.unwrap().unwrap().last_event_seq,
                5
            );
            assert_eq!(store.list_runs().await.unwrap(), vec![run]);
            assert!(store.delete(&run).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_failed_run_is_persisted_to_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnyCheckpointStore::connect(&StorageConfig::Sqlite {
            url: format!("sqlite://{}?mode=rwc", dir.path().join("runs.db").display()),
        })
        .await
        .unwrap();
        let manager = Arc::new(CheckpointManager::new(store));

        let plan = Plan::new(
            "persisted",
            vec![
                Step::new(1, "first", WorkerKind::Coder),
                Step::new(2, "second", WorkerKind::Coder).depends_on([1]),
            ],
        );
        let exec = ParallelExecutor::new(
            FnRunner(|step: Step, _ctx: StepContext| async move {
                if step.id == 2 {
                    Err(WorkerError::failed("not yet"))
                } else {
                    Ok(WorkerOutput::text("one"))
                }
            }),
            RetryManager::new(RetryConfig::disabled()),
            EventBus::with_persistence(&EventBusConfig::default(), manager.clone()),
            ExecutorConfig::default(),
        );
        let result = exec.run(&plan, CancellationToken::new()).await.unwrap();
        assert!(!result.success);

        let stored = manager.load(result.run_id).await.unwrap();
        assert_eq!(stored.run_status, RunStatus::Failed);
        assert_eq!(stored.steps[&1].status, StepStatus::Completed);
        assert_eq!(stored.steps[&2].status, StepStatus::Failed);
    }
}
