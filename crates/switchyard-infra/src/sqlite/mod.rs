//! SQLite storage for run snapshots and checkpoints.

pub mod checkpoint;
pub mod pool;
pub mod run;

use chrono::{DateTime, SecondsFormat, Utc};
use switchyard_types::error::RepositoryError;
use uuid::Uuid;

pub use checkpoint::SqliteCheckpointStore;
pub use pool::DatabasePool;
pub use run::SqliteRunStore;

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}
