//! libSQL/SQLite backend.
//!
//! One `libsql::Database` handle per backend; every operation opens a fresh
//! connection. Decimals are stored as TEXT so no precision is lost, dates as
//! `YYYY-MM-DD` and timestamps as RFC 3339 with microseconds.

mod billing;

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::Database;
use crate::db::libsql_migrations::SCHEMA;
use crate::error::DatabaseError;

/// Writers queue on the database lock instead of failing immediately.
const CONNECTION_PRAGMAS: &str = "PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;";

pub struct LibSqlBackend {
    db: libsql::Database,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("failed to create database dir {:?}: {}", parent, e))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open {:?}: {}", path, e)))?;
        tracing::debug!("Opened libSQL database at {:?}", path);
        Ok(Self { db })
    }

    pub(crate) async fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;
        conn.execute_batch(CONNECTION_PRAGMAS).await?;
        Ok(conn)
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }
}

// ==================== Row helpers ====================

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<Option<String>>(idx).ok().flatten()
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or_default()
}

pub(crate) fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 and SQLite's `datetime('now')` format.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("invalid timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} date '{}': {}", field, raw, e)))
}

pub(crate) fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} '{}': {}", field, raw, e)))
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} uuid: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{fmt_ts, parse_timestamp};

    #[test]
    fn timestamps_round_trip_and_accept_sqlite_format() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("ts");
        assert_eq!(parse_timestamp(&fmt_ts(&ts)).expect("rfc3339"), ts);
        assert_eq!(parse_timestamp("2026-03-04 05:06:07").expect("sqlite"), ts);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
