//! Embedded libSQL storage backend.
//!
//! Single source of truth for all durable state (spec: the store is the one
//! place components read/write through). Local file-based with WAL
//! journaling, or in-memory for tests.

pub mod approvals;
pub mod audit;
pub mod bindings;
mod migrations;
pub mod sessions;
pub mod tasks;
pub mod uploads;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};

use crate::error::DatabaseError;

/// Shared database handle. Connections are created per operation; SQLite's
/// own locking serializes writers, with a busy timeout so concurrent writers
/// wait instead of failing instantly.
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    // Kept alive for the lifetime of in-memory test databases; see `open_memory`.
    _temp_dir: Option<Arc<tempfile::TempDir>>,
}

impl Database {
    /// Open (or create) the local database file and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("failed to create database directory: {e}"))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open database: {e}")))?;
        let this = Self {
            db: Arc::new(db),
            _temp_dir: None,
        };
        this.migrate().await?;
        Ok(this)
    }

    /// In-memory database for tests.
    ///
    /// Backed by a temp-dir SQLite file rather than `:memory:`: this libsql
    /// version opens a brand-new, unshared in-memory database on every
    /// `connect()` call, so separate connections never see each other's
    /// writes. A temp file gives every connection the same durable backing
    /// store while staying private and disposable like a real in-memory db.
    pub async fn open_memory() -> Result<Self, DatabaseError> {
        let temp_dir = tempfile::tempdir().map_err(|e| {
            DatabaseError::Pool(format!("failed to create temp dir for test database: {e}"))
        })?;
        let path = temp_dir.path().join("test.sqlite3");
        let db = libsql::Builder::new_local(&path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open in-memory database: {e}")))?;
        let this = Self {
            db: Arc::new(db),
            _temp_dir: Some(Arc::new(temp_dir)),
        };
        this.migrate().await?;
        Ok(this)
    }

    pub(crate) async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("failed to create connection: {e}")))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to set busy_timeout: {e}")))?;
        Ok(conn)
    }

    async fn migrate(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("failed to enable WAL: {e}")))?;
        conn.execute_batch(migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }
}

// ==================== Row / timestamp helpers ====================

/// Parse an ISO-8601 timestamp from storage. Accepts RFC 3339 (the canonical
/// write format) plus naive `datetime()` output for rows written by hand.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {s:?}"))
}

/// Canonical storage format: RFC 3339 with millisecond precision.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn fmt_opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Returns None for SQL NULL, preserves empty strings as Some("").
pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

pub(crate) fn get_opt_i64(row: &libsql::Row, idx: i32) -> Option<i64> {
    row.get::<i64>(idx).ok()
}

pub(crate) fn get_bool(row: &libsql::Row, idx: i32) -> bool {
    row.get::<i64>(idx).unwrap_or(0) != 0
}

pub(crate) fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

pub(crate) fn opt_i64(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Parse a required timestamp column; falls back to the Unix epoch so a
/// corrupt row is detectable rather than silently replaced by now().
pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    match row.get::<String>(idx) {
        Ok(s) => match parse_timestamp(&s) {
            Ok(dt) => dt,
            Err(e) => {
                tracing::warn!("bad timestamp in column {idx}: {e}");
                DateTime::<Utc>::UNIX_EPOCH
            }
        },
        Err(_) => DateTime::<Utc>::UNIX_EPOCH,
    }
}

pub(crate) fn get_opt_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    row.get::<String>(idx)
        .ok()
        .and_then(|s| parse_timestamp(&s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_naive_forms() {
        assert!(parse_timestamp("2026-08-02T10:30:00.123Z").is_ok());
        assert!(parse_timestamp("2026-08-02 10:30:00.123").is_ok());
        assert!(parse_timestamp("2026-08-02 10:30:00").is_ok());
        assert!(parse_timestamp("yesterday-ish").is_err());
    }

    #[test]
    fn timestamp_round_trips() {
        let now = Utc::now();
        let parsed = parse_timestamp(&fmt_ts(&now)).unwrap();
        assert!((now - parsed).num_milliseconds().abs() < 2);
    }

    #[tokio::test]
    async fn opens_in_memory_with_schema() {
        let db = Database::open_memory().await.unwrap();
        let conn = db.connect().await.unwrap();
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'tasks'",
                (),
            )
            .await
            .unwrap();
        assert!(rows.next().await.unwrap().is_some());
    }
}
