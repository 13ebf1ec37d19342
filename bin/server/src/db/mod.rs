//! Postgres implementations of the storage ports.
//!
//! This module provides data access for:
//! - Workflow definitions and their steps
//! - Executions, step records and execution events
//! - The execution job queue
//! - Deals, activities and notifications

pub mod crm;
pub mod execution;
pub mod job;
pub mod workflow;

pub use crm::PgCrm;
pub use execution::PgExecutionLog;
pub use job::PgJobQueue;
pub use workflow::PgWorkflowRepository;

use dealflow_workflow::StoreError;
use std::str::FromStr;

/// Parses a stored text column, reporting bad data as a decode error.
pub(crate) fn parse_column<T>(raw: &str, what: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(raw).map_err(|e| decode_error(format!("invalid {what} '{raw}': {e}")))
}

/// Parses an optional stored text column.
pub(crate) fn parse_optional<T>(raw: Option<&str>, what: &str) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|raw| parse_column(raw, what)).transpose()
}

pub(crate) fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    )))
}

/// SQLSTATE codes for failures that succeed when the statement is retried:
/// serialization failure, deadlock, lock not available, statement timeout
/// and the connection exception class.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57014"];

fn is_transient_sqlstate(code: &str) -> bool {
    TRANSIENT_SQLSTATES.contains(&code) || code.starts_with("08")
}

/// Maps a database error onto the port error.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable {
                reason: error.to_string(),
            }
        }
        sqlx::Error::Database(ref db)
            if db.code().is_some_and(|code| is_transient_sqlstate(&code)) =>
        {
            StoreError::Unavailable {
                reason: db.message().to_string(),
            }
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => StoreError::Corrupt {
            reason: error.to_string(),
        },
        sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Conflict {
            reason: db.message().to_string(),
        },
        other => StoreError::Backend {
            reason: other.to_string(),
        },
    }
}
