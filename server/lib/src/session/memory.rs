use concread::bptree::BptreeMap;

use super::{FlowSession, FlowStatus, SessionStore};
use crate::prelude::*;

/// Sessions held in a concurrently readable tree. Writers are serialised by the
/// tree's write transaction, so the version comparison and the replacement in
/// `save` happen atomically.
pub struct InMemorySessionStore {
    sessions: BptreeMap<Uuid, FlowSession>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        InMemorySessionStore {
            sessions: BptreeMap::new(),
        }
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, session_id: Uuid) -> Result<FlowSession, OperationError> {
        let session_read = self.sessions.read();
        session_read
            .get(&session_id)
            .cloned()
            .ok_or(OperationError::SessionNotFound)
    }

    fn insert(&self, session: &FlowSession) -> Result<(), OperationError> {
        let mut session_write = self.sessions.write();
        if session_write.contains_key(&session.session_id) {
            return Err(OperationError::Conflict);
        }
        session_write.insert(session.session_id, session.clone());
        session_write.commit();
        Ok(())
    }

    fn save(&self, session: &FlowSession, expected_version: u64) -> Result<(), OperationError> {
        let mut session_write = self.sessions.write();
        let current = session_write
            .get(&session.session_id)
            .map(|s| s.version)
            .ok_or(OperationError::SessionNotFound)?;

        if current != expected_version {
            flow_warn!(
                session_id = %session.session_id,
                current,
                expected_version,
                "session version conflict"
            );
            return Err(OperationError::Conflict);
        }

        session_write.insert(session.session_id, session.clone());
        session_write.commit();
        Ok(())
    }

    fn mark_expired(&self, ct: Duration) -> Result<usize, OperationError> {
        let now = odt_from_duration(ct);
        let mut session_write = self.sessions.write();

        let stale: Vec<FlowSession> = session_write
            .iter()
            .filter(|(_, s)| s.status == FlowStatus::InProgress && s.is_expired_at(ct))
            .map(|(_, s)| s.clone())
            .collect();

        let count = stale.len();
        for mut session in stale {
            session.status = FlowStatus::Expired;
            session.updated_at = now;
            session.version += 1;
            session_write.insert(session.session_id, session);
        }
        session_write.commit();
        Ok(count)
    }

    fn delete_expired(&self, cutoff: Duration) -> Result<usize, OperationError> {
        let cutoff = odt_from_duration(cutoff);
        let mut session_write = self.sessions.write();

        let doomed: Vec<Uuid> = session_write
            .iter()
            .filter(|(_, s)| s.expires_at < cutoff)
            .map(|(k, _)| *k)
            .collect();

        for k in doomed.iter() {
            session_write.remove(k);
        }
        session_write.commit();
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::InMemorySessionStore;
    use crate::session::tests::exercise_store;

    #[test]
    fn test_memory_session_store() {
        sketching::test_init();
        let store = InMemorySessionStore::new();
        exercise_store(&store);
    }
}
