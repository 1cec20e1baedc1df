#![forbid(unsafe_code)]

mod contract;
mod error;
mod jobs;
mod requests;
mod schema;

pub use contract::{JobStore, TransitionOutcome};
pub use error::StoreError;
pub use requests::*;

use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HOST_LEN: usize = 128;

/// Job table backed by a SQLite database file.
///
/// Several worker processes may open the same file; every state transition runs in an
/// `IMMEDIATE` transaction with the expected state in the `UPDATE ... WHERE` clause.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    db_path: Option<PathBuf>,
    host: String,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        let store = Self::from_connection(conn, Some(db_path))?;
        tracing::debug!(path = ?store.db_path, "opened job store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::install(&conn)?;

        Ok(Self {
            conn,
            db_path,
            host: default_host(),
        })
    }

    /// Name recorded in the `host` column of log entries written through this handle.
    pub fn with_host(mut self, host: impl Into<String>) -> Result<Self, StoreError> {
        self.host = normalize_host(host.into())?;
        Ok(self)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

fn default_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .and_then(|h| normalize_host(h).ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn normalize_host(raw: String) -> Result<String, StoreError> {
    let host = raw.trim();
    if host.is_empty() {
        return Err(StoreError::InvalidInput("host must not be empty"));
    }
    if host.len() > MAX_HOST_LEN {
        return Err(StoreError::InvalidInput("host is too long"));
    }
    Ok(host.to_string())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message
                    .as_deref()
                    .is_some_and(|value| value.contains("UNIQUE constraint failed"))
        }
        _ => false,
    }
}

fn to_sqlite_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("numeric overflow"))
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
