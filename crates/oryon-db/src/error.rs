//! Error types for the database layer.

use std::time::Duration;

use crate::migrations::MigrationError;

/// Errors surfaced by the connection manager and its query helpers.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Required connection settings are missing, blank or malformed.
    #[error("database configuration incomplete: {0}")]
    Configuration(String),

    /// A physical connection to the instance could not be opened.
    #[error("database connection failed: {0}")]
    Connection(String),

    /// A statement failed after a connection was obtained.
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// Every pooled connection stayed checked out for the whole timeout.
    #[error("connection pool exhausted: no connection available after {0:?}")]
    PoolExhausted(Duration),

    /// The schema could not be brought up to date.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// No pool exists because startup initialization failed.
    #[error("database is not configured")]
    Unavailable,
}
