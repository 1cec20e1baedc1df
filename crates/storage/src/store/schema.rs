#![forbid(unsafe_code)]

use super::{StoreError, now_ms};
use rusqlite::{Connection, OptionalExtension, params};

const SCHEMA_VERSION: i64 = 1;

pub(super) fn install(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_state (
          singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
          schema_version INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          tag TEXT NOT NULL UNIQUE,
          state TEXT NOT NULL DEFAULT '?',
          state_prev TEXT NOT NULL DEFAULT '?',
          qa_state TEXT NOT NULL DEFAULT '?',
          location TEXT NOT NULL,
          mode TEXT NOT NULL,
          parameters TEXT NOT NULL DEFAULT '',
          priority INTEGER NOT NULL DEFAULT 0,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS job_location_state
          ON job(location, state, priority DESC, id);

        CREATE TABLE IF NOT EXISTS input_file (
          job_id INTEGER NOT NULL REFERENCES job(id),
          seq INTEGER NOT NULL,
          filename TEXT NOT NULL,
          PRIMARY KEY (job_id, seq)
        );

        CREATE TABLE IF NOT EXISTS output_file (
          job_id INTEGER NOT NULL REFERENCES job(id),
          seq INTEGER NOT NULL,
          filename TEXT NOT NULL,
          PRIMARY KEY (job_id, seq)
        );

        CREATE TABLE IF NOT EXISTS log (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id INTEGER NOT NULL REFERENCES job(id),
          ts_ms INTEGER NOT NULL,
          state_prev TEXT NOT NULL,
          state_new TEXT NOT NULL,
          message TEXT NOT NULL,
          host TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS log_job ON log(job_id, id);
        "#,
    )?;

    let stored: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM schema_state WHERE singleton=1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        None => {
            conn.execute(
                "INSERT OR IGNORE INTO schema_state(singleton, schema_version, created_at_ms) VALUES (1, ?1, ?2)",
                params![SCHEMA_VERSION, now_ms()],
            )?;
        }
        Some(version) if version == SCHEMA_VERSION => {}
        Some(_) => return Err(StoreError::InvalidInput("unsupported job store schema version")),
    }

    Ok(())
}
