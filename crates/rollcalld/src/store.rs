//! SQLite-backed student directory, attendance store and session registry.

use chrono::{NaiveDate, NaiveTime};
use rollcall_core::attendance::{
    AttendanceRecord, AttendanceStatus, AttendanceStore, SessionRegistry, StoreError, StudentDirectory,
};
use rollcall_core::{Identity, SessionId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id  TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    session_token  TEXT NOT NULL UNIQUE,
    is_active      INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS attendance (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id  TEXT NOT NULL,
    session_id  INTEGER NOT NULL REFERENCES sessions(id),
    date        TEXT NOT NULL,
    time        TEXT NOT NULL,
    status      TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS attendance_once ON attendance(student_id, session_id);
";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register a student, or rename an existing one.
    pub fn upsert_student(&self, identity: &Identity, name: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO students (student_id, name) VALUES (?1, ?2)
                 ON CONFLICT(student_id) DO UPDATE SET name = excluded.name",
                params![identity.as_str(), name],
            )
            .map_err(backend)?;
        Ok(())
    }

    /// Delete a student by raw or folder-safe identifier. Returns whether a row was removed.
    pub fn remove_student(&self, raw: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM students WHERE student_id = ?1 OR REPLACE(student_id, '/', '-') = ?1",
                params![raw],
            )
            .map_err(backend)?;
        Ok(removed > 0)
    }

    /// Start an active session for `token`, reactivating it if it exists.
    pub fn open_session(&self, token: &str) -> Result<SessionId, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (session_token, is_active) VALUES (?1, 1)
             ON CONFLICT(session_token) DO UPDATE SET is_active = 1",
            params![token],
        )
        .map_err(backend)?;
        let id = conn
            .query_row(
                "SELECT id FROM sessions WHERE session_token = ?1",
                params![token],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(SessionId(id))
    }

    pub fn close_session(&self, session: SessionId) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute("UPDATE sessions SET is_active = 0 WHERE id = ?1", params![session.0])
            .map_err(backend)?;
        Ok(changed > 0)
    }

    /// The active session registered under `token`.
    pub fn active_session(&self, token: &str) -> Result<Option<SessionId>, StoreError> {
        self.conn()
            .query_row(
                "SELECT id FROM sessions WHERE session_token = ?1 AND is_active = 1",
                params![token],
                |row| row.get(0),
            )
            .optional()
            .map(|id| id.map(SessionId))
            .map_err(backend)
    }

    pub fn attendance(&self, session: SessionId) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT student_id, date, time FROM attendance WHERE session_id = ?1 ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![session.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(backend)?;

        let mut records = Vec::new();
        for row in rows {
            let (student_id, date, time) = row.map_err(backend)?;
            records.push(AttendanceRecord {
                identity: Identity::new(student_id),
                session,
                date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
                    .map_err(|e| StoreError::Backend(format!("bad date {date:?}: {e}")))?,
                time: NaiveTime::parse_from_str(&time, TIME_FORMAT)
                    .map_err(|e| StoreError::Backend(format!("bad time {time:?}: {e}")))?,
                status: AttendanceStatus::Present,
            });
        }
        Ok(records)
    }

    /// Delete every student and attendance record. Sessions are kept.
    pub fn reset(&self) -> Result<(), StoreError> {
        self.conn()
            .execute_batch("DELETE FROM attendance; DELETE FROM students;")
            .map_err(backend)?;
        tracing::info!("attendance database reset");
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StudentDirectory for SqliteStore {
    fn resolve(&self, raw: &str) -> Result<Option<Identity>, StoreError> {
        self.conn()
            .query_row(
                "SELECT student_id FROM students
                 WHERE student_id = ?1 OR REPLACE(student_id, '/', '-') = ?1",
                params![raw],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|id| id.map(Identity::new))
            .map_err(backend)
    }

    fn lookup_name(&self, identity: &Identity) -> Result<Option<String>, StoreError> {
        self.conn()
            .query_row(
                "SELECT name FROM students WHERE student_id = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }
}

impl AttendanceStore for SqliteStore {
    fn exists(&self, identity: &Identity, session: SessionId) -> Result<bool, StoreError> {
        self.conn()
            .query_row(
                "SELECT 1 FROM attendance WHERE student_id = ?1 AND session_id = ?2",
                params![identity.as_str(), session.0],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(backend)
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let result = self.conn().execute(
            "INSERT INTO attendance (student_id, session_id, date, time, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.identity.as_str(),
                record.session.0,
                record.date.format(DATE_FORMAT).to_string(),
                record.time.format(TIME_FORMAT).to_string(),
                record.status.as_str(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate {
                    identity: record.identity.clone(),
                    session: record.session,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }
}

impl SessionRegistry for SqliteStore {
    fn is_active(&self, session: SessionId) -> Result<bool, StoreError> {
        self.conn()
            .query_row(
                "SELECT is_active FROM sessions WHERE id = ?1",
                params![session.0],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map(|active| active.unwrap_or(false))
            .map_err(backend)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}
