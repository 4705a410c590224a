//! SQLite implementation of `CheckpointStore`.
//!
//! `UNIQUE (run_id, step_id)` makes the insert idempotent; the stored row
//! is read back so the caller always gets the first checkpoint's id.

use sqlx::Row;
use switchyard_core::checkpoint::CheckpointStore;
use switchyard_types::checkpoint::Checkpoint;
use switchyard_types::error::RepositoryError;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_error};

pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct CheckpointRow {
    id: String,
    run_id: String,
    step_id: String,
    state: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        Ok(Checkpoint {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            state: serde_json::from_str(&self.state)
                .map_err(|e| RepositoryError::Query(format!("invalid checkpoint state: {e}")))?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, run_id, step_id, state, created_at FROM checkpoints";

impl CheckpointStore for SqliteCheckpointStore {
    async fn insert_if_absent(&self, checkpoint: &Checkpoint) -> Result<Checkpoint, RepositoryError> {
        let state = serde_json::to_string(&checkpoint.state)
            .map_err(|e| RepositoryError::Query(format!("serialize checkpoint state: {e}")))?;

        sqlx::query(
            r#"INSERT INTO checkpoints (id, run_id, step_id, state, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_id) DO NOTHING"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.run_id.to_string())
        .bind(&checkpoint.step_id)
        .bind(&state)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        // Read through the writer: the reader may not see the row yet.
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE run_id = ? AND step_id = ?"))
            .bind(checkpoint.run_id.to_string())
            .bind(&checkpoint.step_id)
            .fetch_one(&self.pool.writer)
            .await
            .map_err(query_error)?;
        CheckpointRow::from_row(&row)
            .map_err(query_error)?
            .into_checkpoint()
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE run_id = ? ORDER BY created_at ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                CheckpointRow::from_row(row)
                    .map_err(query_error)?
                    .into_checkpoint()
            })
            .collect()
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use switchyard_core::checkpoint::CheckpointManager;

    use super::*;
    use crate::sqlite::pool::test_pool;

    #[tokio::test]
    async fn checkpoints_are_idempotent_and_ordered() {
        let (pool, _dir) = test_pool().await;
        let manager = CheckpointManager::new(Arc::new(SqliteCheckpointStore::new(pool)));
        let run_id = Uuid::now_v7();

        let first = manager
            .checkpoint(run_id, "a", json!({"output": {"main": []}, "state": null}))
            .await
            .unwrap();
        let again = manager
            .checkpoint(run_id, "a", json!({"output": {}, "state": 1}))
            .await
            .unwrap();
        assert_eq!(first, again);

        manager.checkpoint(run_id, "b", json!({"output": {}})).await.unwrap();
        manager
            .checkpoint(Uuid::now_v7(), "a", json!({"output": {}}))
            .await
            .unwrap();

        let listed = manager.list(run_id).await.unwrap();
        let steps: Vec<&str> = listed.iter().map(|c| c.step_id.as_str()).collect();
        assert_eq!(steps, vec!["a", "b"]);
        assert_eq!(listed[0].state["state"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn delete_run_counts_rows() {
        let (pool, _dir) = test_pool().await;
        let store = SqliteCheckpointStore::new(pool);
        let manager = CheckpointManager::new(Arc::new(store));
        let run_id = Uuid::now_v7();
        for step in ["a", "b", "c"] {
            manager.checkpoint(run_id, step, json!({})).await.unwrap();
        }

        assert_eq!(manager.cleanup(run_id).await.unwrap(), 3);
        assert_eq!(manager.cleanup(run_id).await.unwrap(), 0);
    }
}
