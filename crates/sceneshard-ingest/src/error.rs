//! Ingestion error types

use thiserror::Error;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Errors surfaced by the ingestion pipeline.
///
/// Per-record problems never show up here; they are written to the progress
/// ledger with a [`crate::models::Stage`] tag. These variants describe failures
/// of a whole batch, a whole dataset or the whole run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] sceneshard_common::ShardError),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to prepare shard table '{table}': {reason}")]
    ShardCreation { table: String, reason: String },

    #[error("Upstream fetch failed: {0}")]
    Fetch(String),

    #[error("Worker for '{dataset}' did not finish: {reason}")]
    Worker { dataset: String, reason: String },
}

impl IngestError {
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn shard_creation(table: &str, reason: impl ToString) -> Self {
        Self::ShardCreation {
            table: table.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// True for PostgreSQL unique-constraint violations (SQLSTATE 23505).
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = error {
        return db_err.is_unique_violation();
    }
    false
}

/// True for "relation/column/object already exists" errors raised by racing DDL.
pub fn is_already_exists(error: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = error {
        // duplicate_table, duplicate_column, duplicate_object
        return matches!(db_err.code().as_deref(), Some("42P07" | "42701" | "42710"));
    }
    false
}
