use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use invoice_sync::{Direction, RepositoryError};

use crate::schema;

/// SQLite-backed storage for requests, packages, invoices, watermarks and
/// the audit trail.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open a store backed by a file on disk, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let conn =
            rusqlite::Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        tracing::debug!(path = %path.display(), "opened sync database");
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| StoreError::Database(e.to_string()))?;
        schema::migrations()
            .to_latest(&mut conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version currently applied.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn().map_err(|e| StoreError::Database(e.to_string()))?;
        conn.query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, RepositoryError> {
        self.conn
            .lock()
            .map_err(|_| RepositoryError::Database("connection lock poisoned".into()))
    }
}

/// Errors raised while opening a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub(crate) fn db_error(e: rusqlite::Error) -> RepositoryError {
    RepositoryError::Database(e.to_string())
}

pub(crate) fn corrupt(id: &str, reason: impl Into<String>) -> RepositoryError {
    RepositoryError::Corrupt {
        id: id.to_owned(),
        reason: reason.into(),
    }
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(id: &str, raw: &str) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| corrupt(id, format!("bad date {raw:?}")))
}

/// Fixed-width UTC timestamps so they sort as text.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| corrupt(id, format!("bad timestamp {raw:?}")))
}

pub(crate) fn parse_direction(id: &str, raw: &str) -> Result<Direction, RepositoryError> {
    Direction::parse(raw).ok_or_else(|| corrupt(id, format!("bad direction {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_is_fully_migrated() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), 3);
    }

    #[test]
    fn opening_twice_keeps_schema() {
        let path = std::env::temp_dir()
            .join(format!("invoice-sync-{}", invoice_sync::RequestId::generate()))
            .join("sync.db");

        SqliteStore::open(&path).unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), 3);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn dates_round_trip() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        assert_eq!(parse_date("x", &format_date(date)).unwrap(), date);
        assert!(matches!(
            parse_date("x", "June 9"),
            Err(RepositoryError::Corrupt { .. })
        ));
    }
}
