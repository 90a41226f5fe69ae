//! Durable state of in-flight logins. A [`FlowSession`] is only ever modified by
//! the executor, and every write goes through [`SessionStore::save`] which checks
//! the version the caller loaded. This is what serialises concurrent requests
//! against the same session.

use serde::{Deserialize, Serialize};

use crate::prelude::*;

mod memory;
mod sqlite;

pub use self::memory::InMemorySessionStore;
pub use self::sqlite::SqliteSessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FlowStatus::InProgress)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            FlowStatus::InProgress => "inprogress",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Expired => "expired",
        }
    }
}

impl TryFrom<&str> for FlowStatus {
    type Error = OperationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "inprogress" => Ok(FlowStatus::InProgress),
            "completed" => Ok(FlowStatus::Completed),
            "failed" => Ok(FlowStatus::Failed),
            "expired" => Ok(FlowStatus::Expired),
            other => Err(OperationError::InvalidSessionState(format!(
                "unknown flow status {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSession {
    pub session_id: Uuid,
    pub flow_id: String,
    pub plan_version: u64,
    pub current_stage_index: usize,
    /// Stages the policy gate demanded, run in order before the plan continues.
    pub pending_stages: Vec<String>,
    pub context: FlowContext,
    pub retry_count: u32,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    pub status: FlowStatus,
    /// Bumped on every successful save.
    pub version: u64,
}

impl FlowSession {
    pub fn new(flow_id: &str, plan_version: u64, ttl: Duration, ct: Duration) -> Self {
        let now = odt_from_duration(ct);
        FlowSession {
            session_id: Uuid::new_v4(),
            flow_id: flow_id.to_string(),
            plan_version,
            current_stage_index: 0,
            pending_stages: Vec::new(),
            context: FlowContext::new(),
            retry_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            status: FlowStatus::InProgress,
            version: 0,
        }
    }

    pub fn is_expired_at(&self, ct: Duration) -> bool {
        odt_from_duration(ct) >= self.expires_at
    }

    /// Both records are waiting on the same step of the flow. Retries on that
    /// step do not count as moving on.
    pub fn same_step(&self, other: &FlowSession) -> bool {
        self.status == other.status
            && self.current_stage_index == other.current_stage_index
            && self.pending_stages.first() == other.pending_stages.first()
    }
}

pub trait SessionStore: Send + Sync {
    fn load(&self, session_id: Uuid) -> Result<FlowSession, OperationError>;

    /// Store a new session. Fails if the id is already in use.
    fn insert(&self, session: &FlowSession) -> Result<(), OperationError>;

    /// Replace a session, provided the stored version is still `expected_version`.
    fn save(&self, session: &FlowSession, expected_version: u64) -> Result<(), OperationError>;

    /// Mark in-progress sessions whose expiry has passed as expired. Returns how
    /// many were changed.
    fn mark_expired(&self, ct: Duration) -> Result<usize, OperationError>;

    /// Remove sessions that expired before the cutoff, whatever their status.
    fn delete_expired(&self, cutoff: Duration) -> Result<usize, OperationError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{FlowSession, FlowStatus, SessionStore};
    use crate::prelude::*;

    /// Behaviour every store must share.
    pub(crate) fn exercise_store(store: &dyn SessionStore) {
        let ct = Duration::from_secs(1_000);
        let ttl = Duration::from_secs(300);

        let mut session = FlowSession::new("default-login", 1, ttl, ct);
        session
            .context
            .insert(CTX_PENDING_USER.to_string(), "alice".into());
        store.insert(&session).expect("insert failed");

        // Ids are never reused.
        assert_eq!(store.insert(&session), Err(OperationError::Conflict));

        let loaded = store.load(session.session_id).expect("load failed");
        assert_eq!(loaded, session);

        // A write against the loaded version succeeds once.
        let mut first = loaded.clone();
        first.current_stage_index = 1;
        first.version += 1;
        store.save(&first, loaded.version).expect("save failed");

        let mut second = loaded.clone();
        second.retry_count = 1;
        second.version += 1;
        assert_eq!(
            store.save(&second, loaded.version),
            Err(OperationError::Conflict)
        );

        let reloaded = store.load(session.session_id).expect("load failed");
        assert_eq!(reloaded.current_stage_index, 1);
        assert_eq!(reloaded.retry_count, 0);
        assert_eq!(reloaded.version, 1);

        assert_eq!(
            store.load(Uuid::new_v4()),
            Err(OperationError::SessionNotFound)
        );
        let ghost = FlowSession::new("default-login", 1, ttl, ct);
        assert_eq!(
            store.save(&ghost, 0),
            Err(OperationError::SessionNotFound)
        );

        // Expiry and deletion.
        let mut done = FlowSession::new("default-login", 1, ttl, ct);
        done.status = FlowStatus::Completed;
        store.insert(&done).expect("insert failed");

        assert_eq!(store.mark_expired(ct), Ok(0));
        let after = ct + ttl;
        assert_eq!(store.mark_expired(after), Ok(1));
        let expired = store.load(session.session_id).expect("load failed");
        assert_eq!(expired.status, FlowStatus::Expired);
        assert_eq!(expired.version, 2);
        // Completed sessions keep their status.
        assert_eq!(
            store.load(done.session_id).map(|s| s.status),
            Ok(FlowStatus::Completed)
        );

        assert_eq!(store.delete_expired(after), Ok(0));
        assert_eq!(store.delete_expired(after + Duration::from_secs(1)), Ok(2));
        assert_eq!(
            store.load(session.session_id),
            Err(OperationError::SessionNotFound)
        );
    }
}
