//! Queries against the `health_checks` log.
//!
//! Timestamps are stored as fixed-width UTC text (`YYYY-MM-DDTHH:MM:SS.ffffffZ`)
//! so that range filters and `MAX()` compare lexicographically.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::DbError;

/// Status written for a successful probe.
pub const STATUS_HEALTHY: &str = "healthy";

/// A row of the health-check log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub environment: Option<String>,
}

/// Aggregate over the records newer than some cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthCheckSummary {
    /// Number of matching records.
    pub count: i64,
    /// Newest matching timestamp, if any record matched.
    pub last_check: Option<DateTime<Utc>>,
}

/// Formats a timestamp the way it is stored.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Runs `SELECT 1` and reports whether the expected value came back.
pub fn probe(conn: &Connection) -> Result<bool, DbError> {
    let value: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
    Ok(value == 1)
}

/// Appends a record to the log.
///
/// The stored timestamp has microsecond precision; the returned record
/// carries the value as it was stored.
pub fn record_health_check(
    conn: &Connection,
    status: &str,
    environment: Option<&str>,
    at: DateTime<Utc>,
) -> Result<HealthCheckRecord, DbError> {
    let stored = format_timestamp(at);
    let id: i64 = conn.query_row(
        "INSERT INTO health_checks (timestamp, status, environment)
         VALUES (?1, ?2, ?3)
         RETURNING id",
        params![stored, status, environment],
        |row| row.get(0),
    )?;

    Ok(HealthCheckRecord {
        id,
        timestamp: parse_timestamp(1, &stored)?,
        status: status.to_string(),
        environment: environment.map(str::to_string),
    })
}

/// Counts records strictly newer than `cutoff` and finds the newest one.
pub fn summarize_since(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<HealthCheckSummary, DbError> {
    let (count, last): (i64, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MAX(timestamp) FROM health_checks WHERE timestamp > ?1",
        [format_timestamp(cutoff)],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let last_check = last.map(|raw| parse_timestamp(1, &raw)).transpose()?;
    Ok(HealthCheckSummary { count, last_check })
}
