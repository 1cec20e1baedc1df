#![forbid(unsafe_code)]

use super::*;
use jp_core::ids::{JobId, Location};
use jp_core::model::{JobRecord, LogEntry, NewJob};
use jp_core::{JobState, QaState};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use std::collections::BTreeMap;

const MAX_TAG_LEN: usize = 80;
const MAX_MODE_LEN: usize = 64;
const MAX_PARAMETERS_LEN: usize = 8_000;
const MAX_FILENAME_LEN: usize = 512;
const MAX_LOG_MESSAGE_LEN: usize = 4_000;

const JOB_COLUMNS: &str =
    "id, tag, state, qa_state, location, mode, parameters, priority, created_at_ms, updated_at_ms";
const LOG_COLUMNS: &str = "id, job_id, ts_ms, state_prev, state_new, message, host";

struct RawJobRow {
    id: i64,
    tag: String,
    state: String,
    qa_state: String,
    location: String,
    mode: String,
    parameters: String,
    priority: i64,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl RawJobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tag: row.get(1)?,
            state: row.get(2)?,
            qa_state: row.get(3)?,
            location: row.get(4)?,
            mode: row.get(5)?,
            parameters: row.get(6)?,
            priority: row.get(7)?,
            created_at_ms: row.get(8)?,
            updated_at_ms: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, StoreError> {
        let id = JobId::new(self.id);
        let location = Location::try_new(self.location).map_err(|e| StoreError::CorruptRow {
            job_id: id,
            detail: e.to_string(),
        })?;
        Ok(JobRecord {
            id,
            tag: self.tag,
            state: parse_state(id, &self.state)?,
            qa_state: parse_qa_state(id, &self.qa_state)?,
            location,
            mode: self.mode,
            parameters: self.parameters,
            priority: self.priority,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        })
    }
}

struct RawLogRow {
    id: i64,
    job_id: i64,
    ts_ms: i64,
    state_prev: String,
    state_new: String,
    message: String,
    host: String,
}

impl RawLogRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            ts_ms: row.get(2)?,
            state_prev: row.get(3)?,
            state_new: row.get(4)?,
            message: row.get(5)?,
            host: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry, StoreError> {
        let job_id = JobId::new(self.job_id);
        Ok(LogEntry {
            id: self.id,
            job_id,
            ts_ms: self.ts_ms,
            state_prev: parse_state(job_id, &self.state_prev)?,
            state_new: parse_state(job_id, &self.state_new)?,
            message: self.message,
            host: self.host,
        })
    }
}

fn single_char(raw: &str) -> Option<char> {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Some(ch),
        _ => None,
    }
}

fn parse_state(job_id: JobId, raw: &str) -> Result<JobState, StoreError> {
    single_char(raw)
        .ok_or_else(|| format!("state code {raw:?} is not a single character"))
        .and_then(|ch| JobState::from_code(ch).map_err(|e| e.to_string()))
        .map_err(|detail| StoreError::CorruptRow { job_id, detail })
}

fn parse_qa_state(job_id: JobId, raw: &str) -> Result<QaState, StoreError> {
    single_char(raw)
        .ok_or_else(|| format!("QA code {raw:?} is not a single character"))
        .and_then(|ch| QaState::from_code(ch).map_err(|e| e.to_string()))
        .map_err(|detail| StoreError::CorruptRow { job_id, detail })
}

fn code(state: JobState) -> String {
    state.code().to_string()
}

fn normalize_message(raw: &str) -> Result<String, StoreError> {
    let message = raw.trim();
    if message.is_empty() {
        return Err(StoreError::InvalidInput("log message must not be empty"));
    }
    if message.len() <= MAX_LOG_MESSAGE_LEN {
        return Ok(message.to_string());
    }
    // Failure descriptions can be arbitrarily long; keep the head rather than refusing.
    let mut end = MAX_LOG_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    Ok(format!("{}…", &message[..end]))
}

fn normalize_filenames(files: &[String]) -> Result<Vec<String>, StoreError> {
    files
        .iter()
        .map(|f| {
            let f = f.trim();
            if f.is_empty() {
                return Err(StoreError::InvalidInput("file name must not be empty"));
            }
            if f.len() > MAX_FILENAME_LEN {
                return Err(StoreError::InvalidInput("file name is too long"));
            }
            Ok(f.to_string())
        })
        .collect()
}

fn current_state(conn: &Connection, id: JobId) -> Result<Option<JobState>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM job WHERE id=?1",
            params![id.get()],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|raw| parse_state(id, &raw)).transpose()
}

fn require_state(conn: &Connection, id: JobId) -> Result<JobState, StoreError> {
    current_state(conn, id)?.ok_or(StoreError::UnknownJob(id))
}

struct InsertLogArgs<'a> {
    ts_ms: i64,
    state_prev: JobState,
    state_new: JobState,
    message: &'a str,
    host: &'a str,
}

fn insert_log(conn: &Connection, id: JobId, args: InsertLogArgs<'_>) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO log(job_id, ts_ms, state_prev, state_new, message, host) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.get(),
            args.ts_ms,
            code(args.state_prev),
            code(args.state_new),
            args.message,
            args.host
        ],
    )?;
    Ok(())
}

fn logs_for(conn: &Connection, id: JobId, newest_first: bool) -> Result<Vec<LogEntry>, StoreError> {
    let order = if newest_first { "DESC" } else { "ASC" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOG_COLUMNS} FROM log WHERE job_id=?1 ORDER BY id {order}"
    ))?;
    let mut rows = stmt.query(params![id.get()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(RawLogRow::read(row)?.into_entry()?);
    }
    Ok(out)
}

impl JobStore for SqliteStore {
    fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        let order = if query.prioritize {
            "ORDER BY priority DESC, id ASC"
        } else if query.sort {
            "ORDER BY id ASC"
        } else {
            ""
        };
        let limit = match query.limit {
            Some(limit) => to_sqlite_i64(limit)?,
            None => -1,
        };
        let offset = to_sqlite_i64(query.offset)?;

        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM job
            WHERE (?1 IS NULL OR state=?1)
              AND (?2 IS NULL OR location=?2)
              AND (?3 IS NULL OR qa_state=?3)
            {order}
            LIMIT ?4 OFFSET ?5
            "#
        ))?;
        let mut rows = stmt.query(params![
            query.state.map(code),
            query.location.as_ref().map(Location::as_str),
            query.qa_state.map(|qa| qa.code().to_string()),
            limit,
            offset
        ])?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(RawJobRow::read(row)?.into_record()?);
        }
        Ok(jobs)
    }

    fn get_job(&self, id: JobId) -> Result<JobRecord, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM job WHERE id=?1"),
                params![id.get()],
                RawJobRow::read,
            )
            .optional()?;
        match raw {
            Some(raw) => raw.into_record(),
            None => Err(StoreError::UnknownJob(id)),
        }
    }

    fn change_state(
        &mut self,
        id: JobId,
        new_state: JobState,
        message: &str,
        expected: Option<JobState>,
    ) -> Result<TransitionOutcome, StoreError> {
        let message = normalize_message(message)?;
        if let Some(prior) = expected {
            if !prior.can_transition_to(new_state) {
                return Err(StoreError::InvalidTransition {
                    from: prior,
                    to: new_state,
                });
            }
        }

        let now_ms = now_ms();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let state_prev = match expected {
            Some(prior) => {
                // The expected state is part of the WHERE clause: check and write are one statement.
                let changed = tx.execute(
                    "UPDATE job SET state=?2, state_prev=state, updated_at_ms=?3 WHERE id=?1 AND state=?4",
                    params![id.get(), code(new_state), now_ms, code(prior)],
                )?;
                if changed != 1 {
                    let actual = require_state(&tx, id)?;
                    tracing::debug!(
                        job_id = %id,
                        expected = %prior,
                        actual = %actual,
                        "conditional transition did not apply"
                    );
                    return Ok(TransitionOutcome::Conflict {
                        expected: prior,
                        actual,
                    });
                }
                prior
            }
            None => {
                let current = require_state(&tx, id)?;
                tx.execute(
                    "UPDATE job SET state=?2, state_prev=state, updated_at_ms=?3 WHERE id=?1",
                    params![id.get(), code(new_state), now_ms],
                )?;
                current
            }
        };

        insert_log(
            &tx,
            id,
            InsertLogArgs {
                ts_ms: now_ms,
                state_prev,
                state_new: new_state,
                message: &message,
                host: &self.host,
            },
        )?;

        if new_state == JobState::Error {
            tx.execute("DELETE FROM output_file WHERE job_id=?1", params![id.get()])?;
        }

        tx.commit()?;
        tracing::debug!(job_id = %id, from = %state_prev, to = %new_state, "job state changed");
        Ok(TransitionOutcome::Applied)
    }

    fn add_log(&mut self, id: JobId, message: &str) -> Result<(), StoreError> {
        let message = normalize_message(message)?;
        let tx = self.conn.transaction()?;
        let state = require_state(&tx, id)?;
        insert_log(
            &tx,
            id,
            InsertLogArgs {
                ts_ms: now_ms(),
                state_prev: state,
                state_new: state,
                message: &message,
                host: &self.host,
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_output_files(&mut self, id: JobId, files: &[String]) -> Result<(), StoreError> {
        let files = normalize_filenames(files)?;
        let tx = self.conn.transaction()?;
        require_state(&tx, id)?;
        tx.execute("DELETE FROM output_file WHERE job_id=?1", params![id.get()])?;
        for (seq, filename) in files.iter().enumerate() {
            tx.execute(
                "INSERT INTO output_file(job_id, seq, filename) VALUES (?1, ?2, ?3)",
                params![id.get(), to_sqlite_i64(seq)?, filename],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_output_files(&self, id: JobId) -> Result<Vec<String>, StoreError> {
        require_state(&self.conn, id)?;
        let mut stmt = self
            .conn
            .prepare("SELECT filename FROM output_file WHERE job_id=?1 ORDER BY seq ASC")?;
        let files = stmt
            .query_map(params![id.get()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if files.is_empty() {
            return Err(StoreError::NoOutputFiles(id));
        }
        Ok(files)
    }

    fn add_job(&mut self, job: NewJob) -> Result<JobId, StoreError> {
        let tag = job.tag.trim();
        if tag.is_empty() {
            return Err(StoreError::InvalidInput("job tag must not be empty"));
        }
        if tag.len() > MAX_TAG_LEN {
            return Err(StoreError::InvalidInput("job tag is too long"));
        }
        let mode = job.mode.trim();
        if mode.is_empty() {
            return Err(StoreError::InvalidInput("job mode must not be empty"));
        }
        if mode.len() > MAX_MODE_LEN {
            return Err(StoreError::InvalidInput("job mode is too long"));
        }
        if job.parameters.len() > MAX_PARAMETERS_LEN {
            return Err(StoreError::InvalidInput("job parameters are too long"));
        }
        let inputs = normalize_filenames(&job.input_files)?;

        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let insert = tx.execute(
            r#"
            INSERT INTO job(tag, state, state_prev, qa_state, location, mode, parameters, priority, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
            params![
                tag,
                code(JobState::Queued),
                code(JobState::Unknown),
                QaState::Unknown.code().to_string(),
                job.location.as_str(),
                mode,
                job.parameters,
                job.priority,
                now_ms
            ],
        );
        if let Err(err) = insert {
            if is_constraint_violation(&err) {
                return Err(StoreError::DuplicateTag(tag.to_string()));
            }
            return Err(StoreError::Sql(err));
        }
        let id = JobId::new(tx.last_insert_rowid());

        for (seq, filename) in inputs.iter().enumerate() {
            tx.execute(
                "INSERT INTO input_file(job_id, seq, filename) VALUES (?1, ?2, ?3)",
                params![id.get(), to_sqlite_i64(seq)?, filename],
            )?;
        }

        insert_log(
            &tx,
            id,
            InsertLogArgs {
                ts_ms: now_ms,
                state_prev: JobState::Unknown,
                state_new: JobState::Queued,
                message: "Job created",
                host: &self.host,
            },
        )?;

        tx.commit()?;
        tracing::debug!(job_id = %id, tag, location = %job.location, "job created");
        Ok(id)
    }

    fn get_input_files(&self, id: JobId) -> Result<Vec<String>, StoreError> {
        require_state(&self.conn, id)?;
        let mut stmt = self
            .conn
            .prepare("SELECT filename FROM input_file WHERE job_id=?1 ORDER BY seq ASC")?;
        let files = stmt
            .query_map(params![id.get()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    fn set_qa_state(
        &mut self,
        id: JobId,
        qa_state: QaState,
        message: &str,
    ) -> Result<(), StoreError> {
        let message = normalize_message(&format!("QA state set to {qa_state}: {}", message.trim()))?;
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let state = require_state(&tx, id)?;
        tx.execute(
            "UPDATE job SET qa_state=?2, updated_at_ms=?3 WHERE id=?1",
            params![id.get(), qa_state.code().to_string(), now_ms],
        )?;
        insert_log(
            &tx,
            id,
            InsertLogArgs {
                ts_ms: now_ms,
                state_prev: state,
                state_new: state,
                message: &message,
                host: &self.host,
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_logs(&self, id: JobId) -> Result<Vec<LogEntry>, StoreError> {
        require_state(&self.conn, id)?;
        logs_for(&self.conn, id, false)
    }

    fn find_errors_logs(
        &self,
        location: &Location,
    ) -> Result<BTreeMap<JobId, Vec<LogEntry>>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM job WHERE location=?1 AND state=?2 ORDER BY id ASC")?;
        let ids = stmt
            .query_map(params![location.as_str(), code(JobState::Error)], |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = BTreeMap::new();
        for id in ids.into_iter().map(JobId::new) {
            out.insert(id, logs_for(&self.conn, id, true)?);
        }
        Ok(out)
    }
}
