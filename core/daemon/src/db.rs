//! SQLite persistence for camstream-daemon.
//!
//! This is the single-writer store backing the daemon: one `sessions` row per
//! session id and an append-only `session_transitions` history. Every write
//! runs in one immediate transaction so readers never see half a transition.

use camstream_protocol::{LaunchSpec, SessionRecord, SessionStatus, TransitionRecord};
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;

use crate::error::StoreError;
use crate::session_store::{SessionStore, StatusUpdate};

const SESSION_COLUMNS: &str = "id, alias, device, launch_spec, argv, status, pid, proc_started, \
     log_path, exit_code, last_error, restart_count, created_at, started_at, stopped_at, updated_at";

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    alias TEXT NOT NULL,
                    device TEXT NOT NULL,
                    launch_spec TEXT NOT NULL,
                    argv TEXT NOT NULL,
                    status TEXT NOT NULL,
                    pid INTEGER,
                    proc_started INTEGER,
                    log_path TEXT NOT NULL,
                    exit_code INTEGER,
                    last_error TEXT,
                    restart_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    stopped_at TEXT,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS sessions_device ON sessions (device, status);
                 CREATE TABLE IF NOT EXISTS session_transitions (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    pid INTEGER,
                    exit_code INTEGER,
                    detail TEXT,
                    recorded_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS session_transitions_session
                    ON session_transitions (session_id, seq);
                 COMMIT;",
            )
            .map_err(|err| StoreError::sqlite("Failed to initialize schema", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| StoreError::Dir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| StoreError::sqlite("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::sqlite("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|err| StoreError::sqlite("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| StoreError::sqlite("Failed to set busy_timeout", err))?;

        Ok(conn)
    }
}

impl SessionStore for Db {
    fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let launch_spec = serde_json::to_string(&record.launch_spec)
            .map_err(|err| StoreError::json("Failed to serialize launch spec", err))?;
        let argv = serde_json::to_string(&record.argv)
            .map_err(|err| StoreError::json("Failed to serialize argv", err))?;

        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| StoreError::sqlite("Failed to begin session insert", err))?;

            let exists = tx
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![record.id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(|err| StoreError::sqlite("Failed to check session id", err))?
                .is_some();
            if exists {
                return Err(StoreError::Duplicate(record.id.clone()));
            }

            tx.execute(
                &format!(
                    "INSERT INTO sessions ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    SESSION_COLUMNS
                ),
                params![
                    record.id,
                    record.alias,
                    record.device,
                    launch_spec,
                    argv,
                    record.status.as_str(),
                    record.pid.map(i64::from),
                    record.proc_started.map(|value| value as i64),
                    record.log_path,
                    record.exit_code,
                    record.last_error,
                    record.restart_count,
                    record.created_at,
                    record.started_at,
                    record.stopped_at,
                    record.updated_at
                ],
            )
            .map_err(|err| StoreError::sqlite("Failed to insert session", err))?;

            insert_transition(
                &tx,
                &record.id,
                record.status,
                record.pid,
                record.exit_code,
                Some("created"),
                &record.updated_at,
            )?;

            tx.commit()
                .map_err(|err| StoreError::sqlite("Failed to commit session insert", err))
        })
    }

    fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.with_connection(|conn| select_session(conn, id))
    }

    fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM sessions ORDER BY created_at ASC, id ASC",
                    SESSION_COLUMNS
                ))
                .map_err(|err| StoreError::sqlite("Failed to prepare sessions query", err))?;

            let rows = stmt
                .query_map([], record_from_row)
                .map_err(|err| StoreError::sqlite("Failed to query sessions", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(
                    row.map_err(|err| StoreError::sqlite("Failed to decode session row", err))?,
                );
            }
            Ok(sessions)
        })
    }

    fn update_status(
        &self,
        id: &str,
        update: &StatusUpdate,
    ) -> Result<SessionRecord, StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| StoreError::sqlite("Failed to begin status update", err))?;

            let mut record =
                select_session(&tx, id)?.ok_or_else(|| StoreError::Missing(id.to_string()))?;
            let now = Utc::now().to_rfc3339();

            record.status = update.status;
            record.pid = update.pid;
            record.proc_started = update.proc_started;
            record.exit_code = update.exit_code;
            record.stopped_at = update.stopped_at.clone();
            record.last_error = update.last_error.clone();
            if let Some(started_at) = &update.started_at {
                record.started_at = Some(started_at.clone());
            }
            if update.restarted {
                record.restart_count = record.restart_count.saturating_add(1);
            }
            record.updated_at = now.clone();

            tx.execute(
                "UPDATE sessions SET \
                    status = ?2, pid = ?3, proc_started = ?4, exit_code = ?5, \
                    last_error = ?6, restart_count = ?7, started_at = ?8, \
                    stopped_at = ?9, updated_at = ?10 \
                 WHERE id = ?1",
                params![
                    record.id,
                    record.status.as_str(),
                    record.pid.map(i64::from),
                    record.proc_started.map(|value| value as i64),
                    record.exit_code,
                    record.last_error,
                    record.restart_count,
                    record.started_at,
                    record.stopped_at,
                    record.updated_at
                ],
            )
            .map_err(|err| StoreError::sqlite("Failed to update session status", err))?;

            insert_transition(
                &tx,
                id,
                update.status,
                update.pid,
                update.exit_code,
                update.detail().as_deref(),
                &now,
            )?;

            tx.commit()
                .map_err(|err| StoreError::sqlite("Failed to commit status update", err))?;
            Ok(record)
        })
    }

    fn transitions(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT seq, session_id, status, pid, exit_code, detail, recorded_at \
                     FROM session_transitions WHERE session_id = ?1 ORDER BY seq ASC",
                )
                .map_err(|err| StoreError::sqlite("Failed to prepare transitions query", err))?;

            let rows = stmt
                .query_map(params![id], |row| {
                    Ok(TransitionRecord {
                        seq: row.get(0)?,
                        session_id: row.get(1)?,
                        status: status_from_row(row, 2)?,
                        pid: row.get::<_, Option<i64>>(3)?.map(|pid| pid as u32),
                        exit_code: row.get(4)?,
                        detail: row.get(5)?,
                        recorded_at: row.get(6)?,
                    })
                })
                .map_err(|err| StoreError::sqlite("Failed to query transitions", err))?;

            let mut transitions = Vec::new();
            for row in rows {
                transitions.push(
                    row.map_err(|err| StoreError::sqlite("Failed to decode transition row", err))?,
                );
            }
            Ok(transitions)
        })
    }
}

fn select_session(conn: &Connection, id: &str) -> Result<Option<SessionRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
        params![id],
        record_from_row,
    )
    .optional()
    .map_err(|err| StoreError::sqlite("Failed to query session", err))
}

fn insert_transition(
    conn: &Connection,
    session_id: &str,
    status: SessionStatus,
    pid: Option<u32>,
    exit_code: Option<i32>,
    detail: Option<&str>,
    recorded_at: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO session_transitions (session_id, status, pid, exit_code, detail, recorded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session_id,
            status.as_str(),
            pid.map(i64::from),
            exit_code,
            detail,
            recorded_at
        ],
    )
    .map_err(|err| StoreError::sqlite("Failed to append transition", err))?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let launch_spec_raw: String = row.get(3)?;
    let launch_spec: LaunchSpec = serde_json::from_str(&launch_spec_raw)
        .map_err(|err| conversion_failure(3, format!("Invalid launch_spec: {}", err)))?;
    let argv_raw: String = row.get(4)?;
    let argv: Vec<String> = serde_json::from_str(&argv_raw)
        .map_err(|err| conversion_failure(4, format!("Invalid argv: {}", err)))?;

    Ok(SessionRecord {
        id: row.get(0)?,
        alias: row.get(1)?,
        device: row.get(2)?,
        launch_spec,
        argv,
        status: status_from_row(row, 5)?,
        pid: row.get::<_, Option<i64>>(6)?.map(|pid| pid as u32),
        proc_started: row.get::<_, Option<i64>>(7)?.map(|value| value as u64),
        log_path: row.get(8)?,
        exit_code: row.get(9)?,
        last_error: row.get(10)?,
        restart_count: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        stopped_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn status_from_row(row: &Row<'_>, index: usize) -> rusqlite::Result<SessionStatus> {
    let raw: String = row.get(index)?;
    SessionStatus::from_str(&raw)
        .ok_or_else(|| conversion_failure(index, format!("Unknown session status: {}", raw)))
}

fn conversion_failure(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}
