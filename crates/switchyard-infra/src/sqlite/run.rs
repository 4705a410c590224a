//! SQLite implementation of `RunStore`. Snapshots are stored whole as JSON.

use chrono::Utc;
use sqlx::Row;
use switchyard_core::run_store::{RunStore, RunSummary};
use switchyard_types::error::RepositoryError;
use switchyard_types::run::{RunState, RunStatus};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid, query_error};

pub struct SqliteRunStore {
    pool: DatabasePool,
}

impl SqliteRunStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn parse_status(raw: &str) -> Result<RunStatus, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid run status: {raw}")))
}

impl RunStore for SqliteRunStore {
    async fn save(&self, state: &RunState) -> Result<(), RepositoryError> {
        let json = state
            .to_json()
            .map_err(|e| RepositoryError::Query(format!("serialize run state: {e}")))?;

        sqlx::query(
            r#"INSERT INTO runs (id, graph_name, status, state, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 state = excluded.state,
                 updated_at = excluded.updated_at"#,
        )
        .bind(state.run_id.to_string())
        .bind(&state.graph.name)
        .bind(state.status.as_str())
        .bind(&json)
        .bind(format_datetime(&state.started_at))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunState>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let json: String = row.try_get("state").map_err(query_error)?;
                let state = RunState::from_json(&json)
                    .map_err(|e| RepositoryError::Query(format!("invalid run state JSON: {e}")))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, graph_name, status FROM runs ORDER BY created_at DESC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_error)?;
                let graph_name: String = row.try_get("graph_name").map_err(query_error)?;
                let status: String = row.try_get("status").map_err(query_error)?;
                Ok(RunSummary {
                    run_id: parse_uuid(&id)?,
                    graph_name,
                    status: parse_status(&status)?,
                })
            })
            .collect()
    }
}
