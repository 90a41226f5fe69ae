use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use super::{FlowSession, FlowStatus, SessionStore};
use crate::prelude::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flow_session (
        session_id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        plan_version INTEGER NOT NULL,
        current_stage_index INTEGER NOT NULL,
        pending_stages TEXT NOT NULL,
        context TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        version INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS flow_session_expires_at ON flow_session (expires_at);
";

const COLUMNS: &str = "session_id, flow_id, plan_version, current_stage_index, pending_stages, \
    context, retry_count, created_at, updated_at, expires_at, status, version";

fn sqlite_error(e: rusqlite::Error) -> OperationError {
    admin_error!(?e, "SQLite Error");
    OperationError::SqliteError
}

#[allow(clippy::needless_pass_by_value)] // needs to accept value from `map_err`
fn serde_json_error(e: serde_json::Error) -> OperationError {
    admin_error!(?e, "Serde JSON Error");
    OperationError::SerdeJsonError
}

// Timestamps are stored as nanoseconds so that a round trip is lossless.
fn to_nanos(odt: OffsetDateTime) -> i64 {
    odt.unix_timestamp_nanos() as i64
}

fn from_nanos(n: i64) -> Result<OffsetDateTime, OperationError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(n)).map_err(|e| {
        admin_error!(?e, "invalid stored timestamp");
        OperationError::InvalidSessionState("invalid stored timestamp".to_string())
    })
}

/// The raw columns of a row, decoded outside of the rusqlite row callback so
/// that decoding failures keep their own error.
struct RawSession {
    session_id: String,
    flow_id: String,
    plan_version: i64,
    current_stage_index: i64,
    pending_stages: String,
    context: String,
    retry_count: i64,
    created_at: i64,
    updated_at: i64,
    expires_at: i64,
    status: String,
    version: i64,
}

impl RawSession {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(RawSession {
            session_id: row.get(0)?,
            flow_id: row.get(1)?,
            plan_version: row.get(2)?,
            current_stage_index: row.get(3)?,
            pending_stages: row.get(4)?,
            context: row.get(5)?,
            retry_count: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            expires_at: row.get(9)?,
            status: row.get(10)?,
            version: row.get(11)?,
        })
    }
}

impl TryFrom<RawSession> for FlowSession {
    type Error = OperationError;

    fn try_from(raw: RawSession) -> Result<Self, Self::Error> {
        let session_id = Uuid::parse_str(&raw.session_id).map_err(|e| {
            admin_error!(?e, "invalid stored session id");
            OperationError::InvalidSessionState("invalid stored session id".to_string())
        })?;

        Ok(FlowSession {
            session_id,
            flow_id: raw.flow_id,
            plan_version: raw.plan_version as u64,
            current_stage_index: raw.current_stage_index as usize,
            pending_stages: serde_json::from_str(&raw.pending_stages).map_err(serde_json_error)?,
            context: serde_json::from_str(&raw.context).map_err(serde_json_error)?,
            retry_count: raw.retry_count as u32,
            created_at: from_nanos(raw.created_at)?,
            updated_at: from_nanos(raw.updated_at)?,
            expires_at: from_nanos(raw.expires_at)?,
            status: FlowStatus::try_from(raw.status.as_str())?,
            version: raw.version as u64,
        })
    }
}

/// Sessions persisted in SQLite. The conditional save is a single
/// `UPDATE ... WHERE version = ?` so it also holds if several servers share
/// the database file.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: &str) -> Result<Self, OperationError> {
        let flags = OpenFlags::default();
        let conn = Connection::open_with_flags(path, flags).map_err(sqlite_error)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(sqlite_error)?;
        Self::setup(conn)
    }

    pub fn new_memory() -> Result<Self, OperationError> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        Self::setup(conn)
    }

    fn setup(conn: Connection) -> Result<Self, OperationError> {
        conn.execute_batch(SCHEMA).map_err(sqlite_error)?;
        admin_debug!("session store schema ready");
        Ok(SqliteSessionStore {
            conn: Mutex::new(conn),
        })
    }

    fn get_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, OperationError> {
        self.conn.lock().map_err(|_| {
            admin_error!("session store connection mutex is poisoned");
            OperationError::Backend
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn load(&self, session_id: Uuid) -> Result<FlowSession, OperationError> {
        let conn = self.get_conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM flow_session WHERE session_id = ?1", COLUMNS),
                params![session_id.as_hyphenated().to_string()],
                RawSession::from_row,
            )
            .optional()
            .map_err(sqlite_error)?
            .ok_or(OperationError::SessionNotFound)?;
        FlowSession::try_from(raw)
    }

    fn insert(&self, session: &FlowSession) -> Result<(), OperationError> {
        let pending = serde_json::to_string(&session.pending_stages).map_err(serde_json_error)?;
        let context = serde_json::to_string(&session.context).map_err(serde_json_error)?;

        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO flow_session ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                COLUMNS
            ),
            params![
                session.session_id.as_hyphenated().to_string(),
                session.flow_id,
                session.plan_version as i64,
                session.current_stage_index as i64,
                pending,
                context,
                i64::from(session.retry_count),
                to_nanos(session.created_at),
                to_nanos(session.updated_at),
                to_nanos(session.expires_at),
                session.status.as_str(),
                session.version as i64,
            ],
        )
        .map(|_| ())
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                OperationError::Conflict
            }
            e => sqlite_error(e),
        })
    }

    fn save(&self, session: &FlowSession, expected_version: u64) -> Result<(), OperationError> {
        let pending = serde_json::to_string(&session.pending_stages).map_err(serde_json_error)?;
        let context = serde_json::to_string(&session.context).map_err(serde_json_error)?;
        let sid = session.session_id.as_hyphenated().to_string();

        let mut conn = self.get_conn()?;
        let txn = conn.transaction().map_err(sqlite_error)?;

        let changed = txn
            .execute(
                "UPDATE flow_session SET
                    flow_id = ?2, plan_version = ?3, current_stage_index = ?4,
                    pending_stages = ?5, context = ?6, retry_count = ?7,
                    created_at = ?8, updated_at = ?9, expires_at = ?10,
                    status = ?11, version = ?12
                 WHERE session_id = ?1 AND version = ?13",
                params![
                    sid,
                    session.flow_id,
                    session.plan_version as i64,
                    session.current_stage_index as i64,
                    pending,
                    context,
                    i64::from(session.retry_count),
                    to_nanos(session.created_at),
                    to_nanos(session.updated_at),
                    to_nanos(session.expires_at),
                    session.status.as_str(),
                    session.version as i64,
                    expected_version as i64,
                ],
            )
            .map_err(sqlite_error)?;

        if changed == 0 {
            let exists = txn
                .query_row(
                    "SELECT 1 FROM flow_session WHERE session_id = ?1",
                    params![sid],
                    |_| Ok(()),
                )
                .optional()
                .map_err(sqlite_error)?
                .is_some();

            return if exists {
                flow_warn!(session_id = %sid, expected_version, "session version conflict");
                Err(OperationError::Conflict)
            } else {
                Err(OperationError::SessionNotFound)
            };
        }

        txn.commit().map_err(sqlite_error)
    }

    fn mark_expired(&self, ct: Duration) -> Result<usize, OperationError> {
        let now = to_nanos(odt_from_duration(ct));
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE flow_session SET status = ?1, updated_at = ?2, version = version + 1
             WHERE status = ?3 AND expires_at <= ?2",
            params![
                FlowStatus::Expired.as_str(),
                now,
                FlowStatus::InProgress.as_str()
            ],
        )
        .map_err(sqlite_error)
    }

    fn delete_expired(&self, cutoff: Duration) -> Result<usize, OperationError> {
        let cutoff = to_nanos(odt_from_duration(cutoff));
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM flow_session WHERE expires_at < ?1",
            params![cutoff],
        )
        .map_err(sqlite_error)
    }
}
