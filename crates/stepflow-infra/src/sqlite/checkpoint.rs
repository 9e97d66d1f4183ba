//! SQLite checkpoint store.
//!
//! Implements `CheckpointStore` from `stepflow-core`. Each run has one row in
//! `workflow_checkpoints` holding the latest checkpoint as a JSON blob; the
//! upsert only replaces a row when the incoming sequence is not older.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepflow_core::repository::checkpoint::CheckpointStore;
use stepflow_types::error::RepositoryError;
use stepflow_types::workflow::WorkflowCheckpoint;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    checkpoint: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            checkpoint: row.try_get("checkpoint")?,
        })
    }

    fn into_checkpoint(self) -> Result<WorkflowCheckpoint, RepositoryError> {
        serde_json::from_str(&self.checkpoint)
            .map_err(|e| RepositoryError::Query(format!("invalid checkpoint JSON: {e}")))
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// CheckpointStore implementation
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(checkpoint)
            .map_err(|e| RepositoryError::Serialization(format!("serialize checkpoint: {e}")))?;
        let seq = i64::try_from(checkpoint.last_event_seq)
            .map_err(|_| RepositoryError::Query("event sequence out of range".to_string()))?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_checkpoints
                   (run_id, plan_id, run_status, last_event_seq, checkpoint, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                   plan_id = excluded.plan_id,
                   run_status = excluded.run_status,
                   last_event_seq = excluded.last_event_seq,
                   checkpoint = excluded.checkpoint,
                   created_at = excluded.created_at
               WHERE excluded.last_event_seq >= workflow_checkpoints.last_event_seq"#,
        )
        .bind(checkpoint.run_id.to_string())
        .bind(checkpoint.plan_id.to_string())
        .bind(checkpoint.run_status.as_str())
        .bind(seq)
        .bind(&json)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "stale checkpoint for run {}: seq {} is older than the stored checkpoint",
                checkpoint.run_id, checkpoint.last_event_seq
            )));
        }
        Ok(())
    }

    async fn load_latest(&self, run_id: &Uuid) -> Result<Option<WorkflowCheckpoint>, RepositoryError> {
        let row = sqlx::query("SELECT checkpoint FROM workflow_checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let parsed = CheckpointRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(parsed.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query("SELECT run_id FROM workflow_checkpoints ORDER BY run_id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("run_id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                parse_uuid(&id)
            })
            .collect()
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stepflow_types::workflow::{RunSnapshot, RunStatus, StepSnapshot};

    async fn test_store() -> (SqliteCheckpointStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteCheckpointStore::new(pool), dir)
    }

    fn checkpoint(run_id: Uuid, seq: u64, status: RunStatus) -> WorkflowCheckpoint {
        let snapshot = RunSnapshot {
            run_id,
            plan_id: Uuid::now_v7(),
            status,
            steps: BTreeMap::from([(1, StepSnapshot::pending())]),
        };
        WorkflowCheckpoint::from_snapshot(&snapshot, seq)
    }

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let (store, _dir) = test_store().await;
        let run = Uuid::now_v7();
        store.save(&checkpoint(run, 2, RunStatus::Running)).await.unwrap();
        let newer = checkpoint(run, 9, RunStatus::Completed);
        store.save(&newer).await.unwrap();

        let loaded = store.load_latest(&run).await.unwrap().unwrap();
        assert_eq!(loaded.last_event_seq, 9);
        assert_eq!(loaded.run_status, RunStatus::Completed);
        assert_eq!(loaded.steps, newer.steps);
        assert!(store.load_latest(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_checkpoint_rejected() {
        let (store, _dir) = test_store().await;
        let run = Uuid::now_v7();
        store.save(&checkpoint(run, 10, RunStatus::Running)).await.unwrap();

        let err = store
            .save(&checkpoint(run, 4, RunStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(
            store.load_latest(&run).await.unwrap().unwrap().last_event_seq,
            10
        );

        // Same sequence overwrites.
        store.save(&checkpoint(run, 10, RunStatus::Failed)).await.unwrap();
        assert_eq!(
            store.load_latest(&run).await.unwrap().unwrap().run_status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (store, _dir) = test_store().await;
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        store.save(&checkpoint(b, 1, RunStatus::Running)).await.unwrap();
        store.save(&checkpoint(a, 1, RunStatus::Running)).await.unwrap();

        assert_eq!(store.list_runs().await.unwrap(), vec![a, b]);
        assert!(store.delete(&a).await.unwrap());
        assert!(!store.delete(&a).await.unwrap());
        assert_eq!(store.list_runs().await.unwrap(), vec![b]);
    }
}
